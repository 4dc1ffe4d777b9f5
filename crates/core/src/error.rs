use crate::reconnect::SessionPhase;

/// Errors reported back to the client for a single operation.
///
/// None of these end the connection; the client gets `{ok:false, error}` and
/// may try again.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("childId is required")]
    MissingIdentity,
    #[error("Chat session '{0}' not found")]
    SessionNotFound(String),
    #[error("Chat session '{0}' belongs to a different child")]
    OwnershipMismatch(String),
    #[error("Connection is already bound to chat session '{0}'")]
    SessionRebind(String),
    #[error("Cannot start while the session is {0}")]
    InvalidPhase(SessionPhase),
    #[error("Failed to open live session: {0}")]
    Upstream(anyhow::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
