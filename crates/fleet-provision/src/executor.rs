//! The out-of-scheduler collaborators: whatever actually starts an instance
//! on a node, and whatever carries placement-failure events to operators.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use fleet_core::{DeploymentRequest, DescriptorKey, NodeId, epoch_millis};
use fleet_lease::LeasedNode;

use crate::error::ProvisionResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A request matched to the node that should run it.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub request: DeploymentRequest,
    pub node: LeasedNode,
    /// Elastic queue slot to put the request back into if the attempt
    /// fails; `None` for replicated instances.
    pub requeue_index: Option<u64>,
}

impl Assignment {
    pub fn node_id(&self) -> &str {
        self.node.identity()
    }
}

/// Starts one service instance on the assigned node.
///
/// Called from a worker task; the pending queue never waits for it.
pub trait ProvisionExecutor: Send + Sync {
    fn provision<'a>(&'a self, assignment: &'a Assignment) -> BoxFuture<'a, ProvisionResult<()>>;
}

/// A (descriptor, node) pairing that became un-instantiable.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProvisionFailureEvent {
    pub deployment: DescriptorKey,
    pub revision: u64,
    pub node: NodeId,
    pub instance_id: u64,
    pub reason: String,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
}

impl ProvisionFailureEvent {
    pub fn new(request: &DeploymentRequest, node: &str, reason: &str) -> Self {
        Self {
            deployment: request.key(),
            revision: request.descriptor.revision,
            node: node.to_string(),
            instance_id: request.instance_id,
            reason: reason.to_string(),
            timestamp: epoch_millis(),
        }
    }
}

pub trait FailureEventPublisher: Send + Sync {
    fn publish(&self, event: ProvisionFailureEvent);
}

/// Writes failure events to the log as JSON.
#[derive(Debug, Default)]
pub struct TracingPublisher;

impl FailureEventPublisher for TracingPublisher {
    fn publish(&self, event: ProvisionFailureEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => error!(target: "fleet::events", event = %json, "provision failure"),
            Err(e) => warn!(error = %e, deployment = %event.deployment, "failed to serialize provision failure event"),
        }
    }
}

/// Forwards failure events into a channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<ProvisionFailureEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProvisionFailureEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FailureEventPublisher for ChannelPublisher {
    fn publish(&self, event: ProvisionFailureEvent) {
        if self.tx.send(event).is_err() {
            warn!("failure event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleet_core::{DeploymentDescriptor, InstanceIdAllocator};

    #[tokio::test]
    async fn channel_publisher_delivers_events() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let request = DeploymentRequest::new(
            Arc::new(DeploymentDescriptor::new("g", "api", 1)),
            Arc::new(InstanceIdAllocator::new()),
        );

        publisher.publish(ProvisionFailureEvent::new(&request, "n1", "bad artifact"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.deployment, DescriptorKey::new("g", "api"));
        assert_eq!(event.node, "n1");
        assert_eq!(event.instance_id, 1);
        assert_eq!(event.reason, "bad artifact");
    }

    #[test]
    fn event_serializes_as_json() {
        let request = DeploymentRequest::new(
            Arc::new(DeploymentDescriptor::new("g", "api", 1)),
            Arc::new(InstanceIdAllocator::new()),
        );
        let event = ProvisionFailureEvent::new(&request, "n1", "nope");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["node"], "n1");
        assert_eq!(json["deployment"]["name"], "api");
    }
}
