//! Errors surfaced to the host application.

use std::time::Duration;
use thiserror::Error;

/// Result of SDK control operations (flush, shutdown).
pub type SdkResult = Result<(), SdkError>;

/// Failures surfaced by `force_flush` and `shutdown`.
///
/// These are the only operations in the crate that report errors to the
/// caller; everything on the span hot path recovers locally and logs instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SdkError {
    /// The client was already shut down when the operation was attempted.
    #[error("operation failed: client already shut down")]
    AlreadyShutdown,

    /// The operation did not complete within the allowed time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Any other failure, described for diagnostics only.
    #[error("operation failed: {0}")]
    Internal(String),
}
