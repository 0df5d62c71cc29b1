//! Lease listeners and event fan-out.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::lease::LeasedResource;

/// Identifier handed out by `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Kind of lease change delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEventKind {
    Granted,
    Renewed,
    Expired,
    Removed,
}

/// Receives lease changes from a `LeaseRegistry`.
///
/// Callbacks run synchronously on the thread that caused the change (or on
/// the reaper task). They must not grant, renew, cancel or remove leases on
/// the same registry.
pub trait LeaseListener<R>: Send + Sync {
    fn on_granted(&self, _lease: &LeasedResource<R>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_renewed(&self, _lease: &LeasedResource<R>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_expired(&self, _lease: &LeasedResource<R>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_removed(&self, _lease: &LeasedResource<R>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Deliver one event to every listener. A listener that errors or panics is
/// logged and skipped; the rest are still notified.
pub(crate) fn fan_out<R>(
    listeners: &[(ListenerId, Arc<dyn LeaseListener<R>>)],
    kind: LeaseEventKind,
    lease: &LeasedResource<R>,
) {
    for (id, listener) in listeners {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match kind {
            LeaseEventKind::Granted => listener.on_granted(lease),
            LeaseEventKind::Renewed => listener.on_renewed(lease),
            LeaseEventKind::Expired => listener.on_expired(lease),
            LeaseEventKind::Removed => listener.on_removed(lease),
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(listener = %id, event = ?kind, cookie = %lease.cookie, error = %e, "lease listener failed");
            }
            Err(_) => {
                error!(listener = %id, event = ?kind, cookie = %lease.cookie, "lease listener panicked");
            }
        }
    }
}
