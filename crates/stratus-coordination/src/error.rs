use thiserror::Error;

/// Error types for coordination-store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("No such node: {0}")]
    NoNode(String),

    #[error("Node '{0}' is owned by another session")]
    BadVersion(String),

    #[error("Connection to the coordination store lost")]
    ConnectionLoss,

    #[error("Session expired")]
    SessionExpired,

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store is shut down")]
    Shutdown,
}

impl StoreError {
    /// Whether the error is expected to clear on its own (retried by the
    /// next scheduled tick rather than propagated).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss | StoreError::Shutdown)
    }
}
