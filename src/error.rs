//! Error types for the hosting engine

use thiserror::Error;

/// Main error type for hosting operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed cluster definition; raised before any provisioning step runs
    #[error("validation error: {0}")]
    Validation(String),

    /// A discovered resource carries the expected name but was not created
    /// for this cluster; the engine never adopts resources it does not own
    #[error("conflict: {0}")]
    Conflict(String),

    /// Provider API failure (timeouts, rate limiting, eventual-consistency
    /// lag); callers retry these within an operation's bounded timeout
    #[error("provider error: {0}")]
    Provider(String),

    /// The requested instance or volume class is unavailable in the target
    /// region; detected up front so provisioning fails before any mutation
    #[error("capacity error: {0}")]
    Capacity(String),

    /// A per-node step failed; siblings continue and the run is reported
    /// failed while partial progress remains resumable
    #[error("node {node}: {message}")]
    NodeFailure {
        /// Name of the node whose step failed
        node: String,
        /// Failure detail
        message: String,
    },

    /// A bounded poll-wait elapsed without the operation completing
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The caller requested cancellation; long waits return this so the
    /// pipeline can unwind gracefully
    #[error("operation canceled")]
    Canceled,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a capacity error with the given message
    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    /// Create a node failure error for the named node
    pub fn node_failure(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NodeFailure {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Returns true when the error is worth retrying within an operation's
    /// bounded timeout (transient provider conditions only)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
