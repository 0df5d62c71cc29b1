//! fleet-selector — chooses which live node hosts a deployment instance.
//!
//! The `NodeSelector` is a lease listener: it mirrors the registry's live
//! nodes and runs the placement pipeline against that mirror.
//!
//! ```text
//! snapshot ─► candidates_for ─► filter_machine_boundary ─► filter_isolation ─► select
//!             (capability)      (max per machine)          (peer exclusion)    (capacity,
//!                                                                               ordering hook)
//! ```
//!
//! # Components
//!
//! - **`selector`** — `NodeSelector` and the placement pipeline
//! - **`filter`** — Machine-boundary filtering
//! - **`isolation`** — Association matching for isolated services
//! - **`policy`** — Candidate ordering policies (registration, round-robin, least-active)

pub mod error;
pub mod filter;
pub mod isolation;
pub mod policy;
pub mod selector;

pub use error::{SelectionError, SelectionResult};
pub use isolation::{AssociationMatcher, HostIsolation};
pub use policy::{LeastActive, OrderingPolicy, RegistrationOrder, RoundRobin};
pub use selector::NodeSelector;
