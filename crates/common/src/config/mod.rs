//! Layered configuration: global → site → node

mod layer;
pub mod path;
pub mod schema;
mod store;
mod view;

pub use layer::{write_atomic, ConfigLayer};
pub use schema::{AttachRecord, GlobalSettings, NetworkPlan, NodeIdentity};
pub use store::{validate_name, ConfigStore, NodeEntry, Scope, FIRST_NODE_ID};
pub use view::{CachedView, FlatConfig};
