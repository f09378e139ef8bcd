//! wgmesh Common Library
//!
//! Configuration hierarchy, mesh topology, effective-configuration compiler,
//! versioning and activation for the wgmesh controller.

pub mod activation;
pub mod addressing;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod error;
pub mod exception_log;
pub mod exec;
pub mod keys;
pub mod layout;
pub mod lock;
pub mod mgmt;
pub mod settings;
pub mod template;
pub mod topology;
pub mod versions;

// Re-export commonly used types
pub use activation::{ActivationReport, VersionSelector};
pub use compiler::EffectiveConfig;
pub use config::{ConfigStore, Scope};
pub use controller::Controller;
pub use error::{Error, Result};
pub use keys::{KeyGenerator, NativeKeyGenerator, WgKeyPair, WgTool};
pub use layout::Layout;
pub use settings::ControllerConfig;
pub use topology::{GeneratedState, Link, TopologyEngine};
pub use versions::PromoteOutcome;

/// Node identifier; unique across all sites
pub type NodeId = u32;

/// wgmesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration root
pub fn default_confroot() -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/wgmesh")
}
