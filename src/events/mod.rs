//! Event plane
//!
//! Infrastructure lifecycle events flow from publishers (orchestrator,
//! controllers, the runtime bridge) through the [`EventBus`] into two
//! fan-out paths: the [`DurableEventSink`] (required, partitioned log)
//! and the [`LiveStreamHub`] (best-effort client push). Neither path is
//! allowed to block provisioning.

mod bridge;
mod bus;
mod consumer;
mod sink;
mod stream;

pub use bridge::RuntimeEventBridge;
pub use bus::EventBus;
pub use consumer::EventConsumer;
pub use sink::DurableEventSink;
pub use stream::{LiveStreamClient, LiveStreamHub};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceKind;

/// What kind of thing an event is about: one of the resource kinds, or
/// a whole stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "POSTGRES_CLUSTER")]
    PostgresCluster,
    #[serde(rename = "NGINX_GATEWAY")]
    NginxGateway,
    #[serde(rename = "DOCKER_SERVICE")]
    DockerService,
    #[serde(rename = "STACK")]
    Stack,
}

impl From<ResourceKind> for EventKind {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::PostgresCluster => EventKind::PostgresCluster,
            ResourceKind::NginxGateway => EventKind::NginxGateway,
            ResourceKind::DockerService => EventKind::DockerService,
        }
    }
}

/// Action carried by an infrastructure event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    #[serde(rename = "resource.created")]
    ResourceCreated,
    #[serde(rename = "resource.create.failed")]
    ResourceCreateFailed,
    #[serde(rename = "resource.deleted")]
    ResourceDeleted,
    #[serde(rename = "stack.created")]
    StackCreated,
    #[serde(rename = "stack.deleted")]
    StackDeleted,
    #[serde(rename = "cluster.created")]
    ClusterCreated,
    #[serde(rename = "cluster.failover")]
    ClusterFailover,
    #[serde(rename = "cluster.node.added")]
    NodeAdded,
    #[serde(rename = "cluster.node.removed")]
    NodeRemoved,
    #[serde(rename = "start.requested")]
    StartRequested,
    #[serde(rename = "stop.requested")]
    StopRequested,
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "die")]
    Die,
    #[serde(rename = "health_status")]
    HealthStatus,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::ResourceCreated => "resource.created",
            EventAction::ResourceCreateFailed => "resource.create.failed",
            EventAction::ResourceDeleted => "resource.deleted",
            EventAction::StackCreated => "stack.created",
            EventAction::StackDeleted => "stack.deleted",
            EventAction::ClusterCreated => "cluster.created",
            EventAction::ClusterFailover => "cluster.failover",
            EventAction::NodeAdded => "cluster.node.added",
            EventAction::NodeRemoved => "cluster.node.removed",
            EventAction::StartRequested => "start.requested",
            EventAction::StopRequested => "stop.requested",
            EventAction::Start => "start",
            EventAction::Die => "die",
            EventAction::HealthStatus => "health_status",
        }
    }
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event for one infrastructure instance.
///
/// `instance_id` is the partition key in the durable log, so events for
/// a single resource are always read back in publish order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureEvent {
    pub instance_id: String,
    pub owner_id: String,
    pub kind: EventKind,
    pub action: EventAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InfrastructureEvent {
    pub fn new(
        instance_id: impl Into<String>,
        owner_id: impl Into<String>,
        kind: impl Into<EventKind>,
        action: EventAction,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            owner_id: owner_id.into(),
            kind: kind.into(),
            action,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// JSON message pushed to live stream clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub infrastructure_id: String,
    pub container_id: Option<String>,
    pub status: String,
    pub action: EventAction,
    pub timestamp: DateTime<Utc>,
}

impl From<&InfrastructureEvent> for StatusUpdate {
    fn from(event: &InfrastructureEvent) -> Self {
        let container_id = event
            .metadata
            .get("container_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let status = event
            .metadata
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or(event.action.as_str())
            .to_string();

        Self {
            infrastructure_id: event.instance_id.clone(),
            container_id,
            status,
            action: event.action,
            timestamp: event.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serializes_to_dotted_name() {
        let json = serde_json::to_string(&EventAction::ResourceCreated).unwrap();
        assert_eq!(json, "\"resource.created\"");

        let back: EventAction = serde_json::from_str("\"die\"").unwrap();
        assert_eq!(back, EventAction::Die);
    }

    #[test]
    fn test_event_round_trip() {
        let event = InfrastructureEvent::new(
            "infra-1",
            "user-1",
            ResourceKind::PostgresCluster,
            EventAction::ClusterCreated,
        )
        .with_metadata(serde_json::json!({ "status": "running" }));

        let json = serde_json::to_string(&event).unwrap();
        let back: InfrastructureEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, "infra-1");
        assert_eq!(back.action, EventAction::ClusterCreated);
    }

    #[test]
    fn test_status_update_pulls_container_from_metadata() {
        let event = InfrastructureEvent::new(
            "infra-2",
            "user-1",
            ResourceKind::DockerService,
            EventAction::Start,
        )
        .with_metadata(serde_json::json!({ "container_id": "abc123" }));

        let update = StatusUpdate::from(&event);
        assert_eq!(update.container_id.as_deref(), Some("abc123"));
        assert_eq!(update.status, "start");
    }
}
