//! Provisioning error types.

use thiserror::Error;

/// How an executor reports a failed placement.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// Worth retrying, on this node or another.
    #[error("transient provision failure: {0}")]
    Transient(String),

    /// The descriptor can never run on this node.
    #[error("permanent provision failure: {0}")]
    Permanent(String),
}

impl ProvisionError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Permanent(r) => r,
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
