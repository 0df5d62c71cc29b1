//! Selector error types.

use thiserror::Error;

use fleet_core::NodeId;

/// Result type alias for selection operations.
pub type SelectionResult<T> = Result<T, SelectionError>;

/// The one selection failure serious enough to surface as an error.
///
/// Finding no node is not an error: `select` returns `Ok(None)`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("node {node} permanently rejected the deployment: {reason}")]
    Permanent { node: NodeId, reason: String },
}

impl SelectionError {
    pub fn node(&self) -> &str {
        match self {
            SelectionError::Permanent { node, .. } => node,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            SelectionError::Permanent { reason, .. } => reason,
        }
    }
}
