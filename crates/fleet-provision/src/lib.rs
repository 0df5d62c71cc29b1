//! fleet-provision — pending deployment requests and their dispatch.
//!
//! Requests that cannot be placed on submission wait in a [`PendingQueue`]
//! and are replayed by processing passes as the node view changes.
//!
//! # Architecture
//!
//! ```text
//! LeaseRegistry ──callbacks──▶ NodeSelector
//!                                   ▲
//!          ProvisionContext::run ───┤ (pass every interval or on change)
//!                                   │
//!            elastic / replicated PendingQueue ──▶ dispatch ──▶ worker task
//!                                                                  │
//!                            ProvisionExecutor ◀───────────────────┘
//!                                   │
//!                 success / transient (requeue) / permanent (un-instantiable)
//! ```
//!
//! # Components
//!
//! - **`queue`** — Ordered pending requests and the processing pass
//! - **`strategy`** — Elastic and replicated placement planning
//! - **`context`** — Dispatch glue, worker pool, counters, scheduling loop
//! - **`throttle`** — Per-node dispatch token bucket
//! - **`executor`** — Executor and failure-event collaborator traits

pub mod context;
pub mod error;
pub mod executor;
pub mod queue;
pub mod strategy;
pub mod throttle;

pub use context::{CountersSnapshot, DispatchConfig, ProvisionContext};
pub use error::{ProvisionError, ProvisionResult};
pub use executor::{
    Assignment, BoxFuture, ChannelPublisher, FailureEventPublisher, ProvisionExecutor,
    ProvisionFailureEvent, TracingPublisher,
};
pub use queue::PendingQueue;
pub use strategy::{ElasticPlacement, Placement, PlacementStrategy, ReplicatedPlacement};
pub use throttle::DispatchThrottle;
