//! wgmesh node attachment
//!
//! One-shot HTTPS handshake that discovers an unconfigured device, hands it a
//! bootstrap script and waits for its confirmation, followed by the controller
//! side setup of the new node.

pub mod attacher;
pub mod bootstrap;
pub mod fsm;
pub mod server;
pub mod session;
pub mod tls;

pub use attacher::Attacher;
pub use bootstrap::BootstrapData;
pub use fsm::{AttachFsm, AttachState, DeviceReport, Target, COMPLETION_MARKER};
pub use session::{Handshake, Mode, Timeouts};
