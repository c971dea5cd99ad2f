/// Errors surfaced by any [`DocumentStore`](crate::DocumentStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Network, timeout or contention failure. Safe to retry.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store's access policy rejected the call.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// An update-only write targeted a record that does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A record body could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// `true` for failures a caller may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// PostgreSQL `insufficient_privilege`.
const SQLSTATE_INSUFFICIENT_PRIVILEGE: &str = "42501";

/// SQLSTATE codes that mean "try again".
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57P01", "57P03"];

impl From<sqlx::Error> for StoreError {
    /// Classify a sqlx error.
    ///
    /// - `42501` maps to [`StoreError::PermissionDenied`].
    /// - Connection exceptions (`08xxx`), serialization failures, deadlocks,
    ///   pool exhaustion and I/O errors map to [`StoreError::Unavailable`].
    /// - Everything else is kept as [`StoreError::Database`].
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            let message = db_err.message().to_string();
            if code == SQLSTATE_INSUFFICIENT_PRIVILEGE {
                return StoreError::PermissionDenied(message);
            }
            if code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code.as_str()) {
                return StoreError::Unavailable(message);
            }
            return StoreError::Database(err);
        }

        if matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        ) {
            return StoreError::Unavailable(err.to_string());
        }
        StoreError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert_matches!(err, StoreError::Unavailable(_));
        assert!(err.is_transient());
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert_matches!(err, StoreError::Database(_));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_permission_denied_is_not_transient() {
        assert!(!StoreError::PermissionDenied("nope".into()).is_transient());
    }
}
