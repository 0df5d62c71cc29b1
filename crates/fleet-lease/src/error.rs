//! Lease registry error types.

use thiserror::Error;

use crate::lease::LeaseCookie;

/// Result type alias for lease operations.
pub type LeaseResult<T> = Result<T, LeaseError>;

/// Errors returned by the lease registry.
///
/// None of these are fatal to the caller: a denied grant means the resource
/// is simply not tracked, and an unknown cookie on cancel means the lease is
/// already gone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease denied: {0}")]
    Denied(String),

    #[error("unknown lease: {0}")]
    UnknownLease(LeaseCookie),

    #[error("lease registry is shut down")]
    Shutdown,
}
