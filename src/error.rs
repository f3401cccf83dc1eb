//! Agent error types

use crate::fabric::NetDevClass;

/// Agent error types
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // Caller errors
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Lookup errors
    #[error("key {0:?} not found in cache")]
    KeyNotFound(String),

    #[error("fabric interface not found: {0}")]
    DeviceNotFound(String),

    #[error("no suitable fabric interface of class {class}")]
    NoSuitableInterface { class: NetDevClass },

    #[error("fabric interface {name:?} does not support provider {provider:?}")]
    ProviderMismatch { name: String, provider: String },

    // Upstream errors (remote calls, hardware scans)
    #[error("upstream error: {0}")]
    Upstream(String),

    // Process monitor is no longer accepting requests
    #[error("process monitor has stopped")]
    MonitorStopped,

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether this error means "the thing you asked for does not exist".
    ///
    /// Callers use this to branch to a remote fetch instead of failing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AgentError::KeyNotFound(_)
                | AgentError::DeviceNotFound(_)
                | AgentError::NoSuitableInterface { .. }
        )
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Upstream and I/O failures qualify; invalid input and lookups that came
    /// up empty will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Upstream(_) | AgentError::Io(_))
    }
}

impl From<nix::Error> for AgentError {
    fn from(err: nix::Error) -> Self {
        AgentError::Io(std::io::Error::from(err))
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
