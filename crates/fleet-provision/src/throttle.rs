//! Per-node dispatch throttle.
//!
//! A token bucket with a burst of one per node: each dispatch to a node
//! takes the node's token, and a new token arrives every `interval`. The
//! caller gets back how long to wait before its dispatch may start, so a
//! processing pass can hand out many placements without sleeping itself
//! while no single node sees them faster than one per interval.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub struct DispatchThrottle {
    interval: Duration,
    /// node → instant its next token becomes available.
    next_token: Mutex<HashMap<String, Instant>>,
}

impl DispatchThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_token: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take the next token for `node` and return the delay until it is valid.
    pub fn reserve(&self, node: &str) -> Duration {
        if self.interval.is_zero() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let mut tokens = self.next_token.lock().unwrap_or_else(PoisonError::into_inner);
        let available = tokens
            .get(node)
            .copied()
            .filter(|at| *at > now)
            .unwrap_or(now);
        tokens.insert(node.to_string(), available + self.interval);
        available - now
    }

    /// Wait until a dispatch to `node` is allowed.
    pub async fn acquire(&self, node: &str) {
        let delay = self.reserve(node);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Forget nodes whose tokens have all refilled.
    pub fn prune(&self) {
        let now = Instant::now();
        self.next_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, at| *at > now);
    }
}
