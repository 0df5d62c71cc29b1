//! Capability-check error kinds.

use thiserror::Error;

/// Result type alias for capability checks.
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Failure raised while checking whether a node can host a deployment.
///
/// A transient failure (a remote check timed out, a probe was refused) only
/// skips the node for the current attempt. A permanent failure marks the
/// (descriptor, node) pairing un-instantiable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("transient capability check failure: {0}")]
    Transient(String),

    #[error("permanent provision failure: {0}")]
    Permanent(String),
}

impl CapabilityError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, CapabilityError::Permanent(_))
    }

    /// The human-readable reason without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            CapabilityError::Transient(r) | CapabilityError::Permanent(r) => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_kind_is_detected() {
        assert!(CapabilityError::Permanent("no gpu".into()).is_permanent());
        assert!(!CapabilityError::Transient("timeout".into()).is_permanent());
    }

    #[test]
    fn reason_strips_kind() {
        let err = CapabilityError::Transient("probe refused".into());
        assert_eq!(err.reason(), "probe refused");
        assert_eq!(
            err.to_string(),
            "transient capability check failure: probe refused"
        );
    }
}
