//! Error types for wgmesh

use thiserror::Error;

/// Result type alias using wgmesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgmesh error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse {path}: {source}")]
    TomlParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize TOML: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Template error in {template}: {message}")]
    Template { template: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provisioning key material failed for link(s) {links}: {reason}")]
    TopologyProvisioning { links: String, reason: String },

    #[error("Version conflict for node {node_id}: {reason}")]
    VersionConflict { node_id: u32, reason: String },

    #[error("Timeout after {seconds}s while {phase}")]
    ProtocolTimeout { phase: String, seconds: u64 },

    #[error("Unexpected message in state {state}: {detail}")]
    ProtocolState { state: String, detail: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Persisted state is corrupt: {0}")]
    CorruptState(String),

    #[error("Command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Shorthand for a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Whether the error concerns operator input rather than the system state.
    /// Such errors are printed to the operator instead of being treated as failures
    /// worth a trace in the exception log.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::VersionConflict { .. }
                | Error::NotFound { .. }
                | Error::AlreadyExists { .. }
                | Error::InvalidName(_)
        )
    }
}
