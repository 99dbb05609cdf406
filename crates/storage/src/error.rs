use std::time::Duration;

/// Boxed backend error kept as the `source` of wrapped failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// All errors that can be returned by a storage or lock provider.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The provider was never initialized, or has been closed.
    #[error("instance closed or not initialized")]
    NotInitialized,

    /// No record with the given identifier exists.
    #[error("{kind} does not exist: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A component identifier failed validation. Nothing was sent to the backend.
    #[error("invalid xname: {xname}")]
    InvalidIdentifier { xname: String },

    /// The write could not be applied as one atomic unit: the encoded object
    /// is too large for the backend, or it kept changing underneath a
    /// compare-and-swap. Retrying the whole operation may succeed.
    #[error("cannot apply write to {key}: {reason}")]
    ConflictRetry { key: String, reason: String },

    /// A backend operation failed mid-flight.
    #[error("{context}: {source}")]
    TransactionFailed {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The backend could not be reached after all connection attempts.
    #[error("{backend} unavailable after {attempts} attempt(s): {source}")]
    BackendUnavailable {
        backend: &'static str,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// A record could not be encoded or decoded.
    #[error("{context}: {source}")]
    Encoding {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// This provider instance already holds the distributed lock.
    #[error("distributed lock already held")]
    AlreadyHeld,

    /// `unlock` was called without a held lock.
    #[error("no distributed lock held to release")]
    NotHeld,

    /// The requested lock duration is below the one second minimum.
    #[error("lock duration request invalid ({requested:?}): must be >= 1s")]
    InvalidLockDuration { requested: Duration },

    /// The lock could not be acquired before the wait deadline.
    #[error("timed out after {waited:?} waiting for distributed lock")]
    LockTimeout { waited: Duration },
}

impl StorageError {
    pub(crate) fn transaction(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        StorageError::TransactionFailed {
            context: context.into(),
            source: source.into(),
        }
    }

    pub(crate) fn encoding(context: impl Into<String>, source: serde_json::Error) -> Self {
        StorageError::Encoding {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Reject a malformed xname before any backend call.
pub(crate) fn validate_xname(xname: &str) -> Result<(), StorageError> {
    if pcs_model::is_valid_xname(xname) {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier {
            xname: xname.to_string(),
        })
    }
}
