//! fleet-lease — time-bounded leases over compute nodes.
//!
//! A node is live while it holds an unexpired lease. The registry grants,
//! renews and cancels leases, sweeps expired ones on a background reaper,
//! and tells registered listeners about every change.
//!
//! # Architecture
//!
//! ```text
//! LeaseRegistry<R>
//!   ├── leases: cookie → LeasedResource<R>   (RwLock<HashMap>)
//!   ├── listeners                             (fan-out, isolated per listener)
//!   └── reaper task                           (lazy, tokio interval + watch shutdown)
//! ```

pub mod error;
pub mod lease;
pub mod listener;
pub mod registry;

pub use error::{LeaseError, LeaseResult};
pub use lease::{Leasable, Lease, LeaseCookie, LeasePolicy, LeasedNode, LeasedResource};
pub use listener::{LeaseEventKind, LeaseListener, ListenerId};
pub use registry::LeaseRegistry;
