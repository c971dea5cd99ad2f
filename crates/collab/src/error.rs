use cowork_core::{CoreError, Lease};
use cowork_db::StoreError;

/// Errors returned by the coordinator. None of them are fatal to the host.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    /// Another owner holds an unexpired lease.
    #[error(
        "Document is being edited by {} until {}",
        .holder.owner_display_name,
        .holder.expires_at
    )]
    Conflict { holder: Box<Lease> },

    /// Invalid input or a rejected administrative action.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The store's access policy rejected the call; the user should
    /// re-authenticate rather than wait.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Any other store failure. Transient ones may be retried.
    #[error(transparent)]
    Store(StoreError),
}

pub type CollabResult<T> = Result<T, CollabError>;

impl CollabError {
    /// `true` if retrying the same call may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollabError::Store(e) if e.is_transient())
    }

    /// The lease that caused a conflict, if this is one.
    pub fn conflict_holder(&self) -> Option<&Lease> {
        match self {
            CollabError::Conflict { holder } => Some(holder),
            _ => None,
        }
    }
}

impl From<StoreError> for CollabError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PermissionDenied(msg) => CollabError::PermissionDenied(msg),
            other => CollabError::Store(other),
        }
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Store(StoreError::Serialization(err))
    }
}
