//! Lease registry — the authoritative set of leased resources.
//!
//! Every mutating call (grant, renew, cancel, remove, expiry) updates the
//! lease map first and notifies listeners second, under one fan-out lock.
//! Listeners therefore never see a lease the registry still believes live,
//! and changes to one resource reach listeners in the order they happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{LeaseError, LeaseResult};
use crate::lease::{Leasable, Lease, LeaseCookie, LeasePolicy, LeasedResource};
use crate::listener::{LeaseEventKind, LeaseListener, ListenerId, fan_out};

type ListenerList<R> = Vec<(ListenerId, Arc<dyn LeaseListener<R>>)>;

/// Handle to the running reaper task.
struct ReaperSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner<R> {
    policy: LeasePolicy,
    leases: RwLock<HashMap<LeaseCookie, LeasedResource<R>>>,
    listeners: RwLock<ListenerList<R>>,
    /// Serializes map mutation + notification.
    fanout: Mutex<()>,
    reaper: Mutex<Option<ReaperSlot>>,
    next_cookie: AtomicU64,
    next_listener: AtomicU64,
    shut_down: AtomicBool,
}

/// Grants and tracks leases, evicting them once they expire.
///
/// Cheap to clone; clones share the same leases and listeners.
pub struct LeaseRegistry<R: Leasable> {
    inner: Arc<Inner<R>>,
}

impl<R: Leasable> Clone for LeaseRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Leasable> LeaseRegistry<R> {
    /// Create a registry. The reaper starts with the first grant.
    pub fn new(policy: LeasePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                leases: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                fanout: Mutex::new(()),
                reaper: Mutex::new(None),
                next_cookie: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.inner.policy
    }

    /// Lease `resource` for `duration` (clamped to the policy maximum).
    ///
    /// Must be called from within a tokio runtime the first time, since the
    /// reaper is spawned lazily on it.
    pub fn grant(&self, resource: R, duration: Duration) -> LeaseResult<Lease> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(LeaseError::Shutdown);
        }
        if duration.is_zero() {
            return Err(LeaseError::Denied("zero lease duration".to_string()));
        }
        let duration = duration.min(self.inner.policy.max_duration);
        let identity = resource.lease_identity();

        self.ensure_reaper()?;

        let _order = self.inner.lock_fanout();
        let (handle, lapsed) = {
            let mut leases = self.inner.write_leases();
            let now = Instant::now();
            let existing = leases
                .values()
                .find(|h| h.resource.lease_identity() == identity)
                .map(|h| (h.cookie, h.is_expired(now)));

            // An expired lease the reaper has not reached yet is already dead.
            let lapsed = match existing {
                Some((_, false)) => {
                    return Err(LeaseError::Denied(format!(
                        "{identity} already holds a live lease"
                    )));
                }
                Some((cookie, true)) => leases.remove(&cookie),
                None => None,
            };

            let cookie = LeaseCookie(self.inner.next_cookie.fetch_add(1, Ordering::Relaxed));
            let handle = LeasedResource {
                cookie,
                expiration: Instant::now() + duration,
                resource,
            };
            leases.insert(cookie, handle.clone());
            (handle, lapsed)
        };

        if let Some(lapsed) = lapsed {
            warn!(cookie = %lapsed.cookie, %identity, "lease expired");
            self.inner.notify(LeaseEventKind::Expired, &lapsed);
        }
        info!(%identity, cookie = %handle.cookie, ?duration, "lease granted");
        self.inner.notify(LeaseEventKind::Granted, &handle);

        Ok(Lease {
            cookie: handle.cookie,
            expiration: handle.expiration,
            duration,
        })
    }

    /// Extend a lease so that it expires `duration` from now.
    pub fn renew(&self, cookie: LeaseCookie, duration: Duration) -> LeaseResult<Lease> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(LeaseError::Shutdown);
        }
        if duration.is_zero() {
            return Err(LeaseError::Denied("zero lease duration".to_string()));
        }
        let duration = duration.min(self.inner.policy.max_duration);

        let _order = self.inner.lock_fanout();
        let handle = {
            let mut leases = self.inner.write_leases();
            let entry = leases
                .get_mut(&cookie)
                .ok_or(LeaseError::UnknownLease(cookie))?;
            entry.expiration = Instant::now() + duration;
            entry.clone()
        };

        debug!(%cookie, ?duration, "lease renewed");
        self.inner.notify(LeaseEventKind::Renewed, &handle);

        Ok(Lease {
            cookie,
            expiration: handle.expiration,
            duration,
        })
    }

    /// Cancel a lease on behalf of its holder.
    ///
    /// An unknown cookie is reported but is not a failure worth escalating:
    /// the lease is already gone.
    pub fn cancel(&self, cookie: LeaseCookie) -> LeaseResult<()> {
        if self.remove(cookie) {
            Ok(())
        } else {
            Err(LeaseError::UnknownLease(cookie))
        }
    }

    /// Administratively remove a lease. Returns `true` (and notifies
    /// listeners once) only if a lease was actually removed.
    pub fn remove(&self, cookie: LeaseCookie) -> bool {
        let _order = self.inner.lock_fanout();
        let removed = self.inner.write_leases().remove(&cookie);

        match removed {
            Some(handle) => {
                info!(%cookie, identity = %handle.resource.lease_identity(), "lease removed");
                self.inner.notify(LeaseEventKind::Removed, &handle);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, cookie: LeaseCookie) -> Option<LeasedResource<R>> {
        self.inner.read_leases().get(&cookie).cloned()
    }

    /// Snapshot of every live lease, ordered by cookie.
    pub fn all(&self) -> Vec<LeasedResource<R>> {
        let mut all: Vec<_> = self.inner.read_leases().values().cloned().collect();
        all.sort_by_key(|h| h.cookie);
        all
    }

    pub fn len(&self) -> usize {
        self.inner.read_leases().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every lease that expired at or before now. Returns how many
    /// were evicted. The reaper calls this on every tick.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn add_listener(&self, listener: Arc<dyn LeaseListener<R>>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        debug!(listener = %id, "lease listener added");
        id
    }

    /// Add a listener and replay a *granted* event to it for every live
    /// lease, in cookie order.
    ///
    /// Registration and replay happen under the fan-out lock, so no grant,
    /// renewal or removal can slip between the replayed state and the
    /// events that follow it.
    pub fn add_listener_with_replay(&self, listener: Arc<dyn LeaseListener<R>>) -> ListenerId {
        let _order = self.inner.lock_fanout();
        let id = self.add_listener(Arc::clone(&listener));
        let only = vec![(id, listener)];
        for handle in self.all() {
            fan_out(&only, LeaseEventKind::Granted, &handle);
        }
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        before != listeners.len()
    }

    /// True once the reaper task has been started (and not shut down).
    pub fn reaper_running(&self) -> bool {
        self.inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Stop the reaper and refuse further grants. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let slot = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
        }
        info!("lease registry shut down");
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn ensure_reaper(&self) -> LeaseResult<()> {
        let mut reaper = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() {
            return Ok(());
        }

        let interval = self.inner.policy.reaper_interval;
        if interval.is_zero() {
            return Err(LeaseError::Denied(
                "lease reaper interval must be non-zero".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            LeaseError::Denied("no async runtime available for the lease reaper".to_string())
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(run_reaper(weak, interval, shutdown_rx));

        *reaper = Some(ReaperSlot {
            handle,
            shutdown_tx,
        });
        info!(?interval, "lease reaper started");
        Ok(())
    }
}

impl<R: Leasable> Inner<R> {
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<LeaseCookie> = self
            .read_leases()
            .values()
            .filter(|h| h.is_expired(now))
            .map(|h| h.cookie)
            .collect();

        let mut evicted = 0;
        for cookie in candidates {
            let _order = self.lock_fanout();
            // Re-check under the write lock: a renewal may have landed since the snapshot.
            let removed = {
                let mut leases = self.write_leases();
                match leases.get(&cookie) {
                    Some(h) if h.is_expired(now) => leases.remove(&cookie),
                    _ => None,
                }
            };

            if let Some(handle) = removed {
                warn!(%cookie, identity = %handle.resource.lease_identity(), "lease expired");
                self.notify(LeaseEventKind::Expired, &handle);
                evicted += 1;
            }
        }
        evicted
    }

    fn notify(&self, kind: LeaseEventKind, handle: &LeasedResource<R>) {
        let listeners: ListenerList<R> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        fan_out(&listeners, kind, handle);
    }

    fn lock_fanout(&self) -> MutexGuard<'_, ()> {
        self.fanout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_leases(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<LeaseCookie, LeasedResource<R>>> {
        self.leases.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_leases(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<LeaseCookie, LeasedResource<R>>> {
        self.leases.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The reaper loop. Holds only a weak reference so that dropping the last
/// registry handle also ends the task.
async fn run_reaper<R: Leasable>(
    inner: Weak<Inner<R>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(registry) = inner.upgrade() else {
                    debug!("lease registry dropped, reaper exiting");
                    break;
                };
                let evicted = registry.sweep();
                if evicted > 0 {
                    debug!(evicted, "reaper sweep evicted expired leases");
                }
            }
            _ = shutdown.changed() => {
                debug!("lease reaper shutting down");
                break;
            }
        }
    }
}
