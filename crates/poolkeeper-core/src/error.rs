//! Error types shared by settings resolution, pool construction, and checkout.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for poolkeeper operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced to callers of the registry and of a pool handle.
///
/// Every variant is returned synchronously to the immediate caller; nothing
/// is retried internally. A failed build leaves no cached entry, so calling
/// again is the retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The instance or its environment section is absent from the source.
    #[error("no configuration for instance `{key}`")]
    ConfigNotFound { key: String },

    /// A required field is missing or has the wrong type.
    #[error("invalid configuration for instance `{key}`: field `{field}`")]
    ConfigInvalid { key: String, field: String },

    /// A configuration file could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),

    /// The factory's liveness check failed (refused, timed out, rejected).
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Every connection is checked out and none came back in time.
    #[error("connection pool exhausted for `{key}` (waited {timeout:?})")]
    PoolExhausted { key: String, timeout: Duration },

    /// Send/recv failure on a checked-out connection.
    #[error("transport error: {0}")]
    Transport(String),
}

impl PoolError {
    pub fn not_found(key: impl ToString) -> Self {
        Self::ConfigNotFound {
            key: key.to_string(),
        }
    }

    pub fn invalid(key: impl ToString, field: &str) -> Self {
        Self::ConfigInvalid {
            key: key.to_string(),
            field: field.to_string(),
        }
    }

    pub fn unreachable(cause: impl std::fmt::Display) -> Self {
        Self::BackendUnreachable(cause.to_string())
    }
}
