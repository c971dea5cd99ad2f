/// Errors raised before any store call is made.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed key, id, requester or configuration.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The caller lacks the authority the operation needs.
    #[error("Forbidden: {0}")]
    Forbidden(String),
}
