//! Deployment and change-staging event types streamed to callers.

use crate::changes::{BlueprintChanges, LinkChanges, ResourceChanges};
use crate::state::{InstanceCompletionDurations, InstanceSnapshot, LinkCompletionDurations,
    ResourceCompletionDurations};
use crate::status::{
    InstanceStatus, LinkStatus, PreciseLinkStatus, PreciseResourceStatus, ResourceStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope for every event emitted during deploy and destroy, serialised on
/// the wire as `{"type": ..., "message": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "camelCase")]
pub enum DeployEvent {
    ResourceUpdate(ResourceDeployUpdateMessage),
    LinkUpdate(LinkDeployUpdateMessage),
    ChildUpdate(ChildDeployUpdateMessage),
    DeploymentUpdate(DeploymentUpdateMessage),
    Finish(DeploymentFinishedMessage),
    PreRollbackState(PreRollbackStateMessage),
}

/// Status update for a single resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDeployUpdateMessage {
    pub instance_id: String,
    pub resource_id: String,
    pub resource_name: String,
    /// Parallel group the resource was dispatched in.
    #[serde(default)]
    pub group: Option<usize>,
    pub status: ResourceStatus,
    pub precise_status: PreciseResourceStatus,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    /// Whether the engine will retry after this (failed) update.
    #[serde(default)]
    pub can_retry: bool,
    /// 1-based attempt number.
    #[serde(default)]
    pub attempt: u32,
    pub update_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub durations: Option<ResourceCompletionDurations>,
}

/// Status update for a single link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDeployUpdateMessage {
    pub instance_id: String,
    pub link_id: String,
    /// `"{resourceA}::{resourceB}"`.
    pub link_name: String,
    pub status: LinkStatus,
    pub precise_status: PreciseLinkStatus,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    #[serde(default)]
    pub can_retry: bool,
    /// 1-based attempt number within the current stage.
    #[serde(default)]
    pub attempt: u32,
    pub update_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub durations: Option<LinkCompletionDurations>,
}

/// Status update for a child blueprint, translated from the child's own
/// instance-level updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildDeployUpdateMessage {
    pub parent_instance_id: String,
    pub child_instance_id: String,
    /// Include name of the child within the parent blueprint.
    pub child_name: String,
    #[serde(default)]
    pub group: Option<usize>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    pub update_timestamp: DateTime<Utc>,
}

/// Instance-level status update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentUpdateMessage {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub update_timestamp: DateTime<Utc>,
}

/// Terminal event for a deploy or destroy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentFinishedMessage {
    pub instance_id: String,
    pub status: InstanceStatus,
    /// Aggregated failure reasons from every failed element.
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    pub finish_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub durations: Option<InstanceCompletionDurations>,
    /// False when further events will follow on the same stream, e.g. an
    /// auto-rollback phase after a failed first deployment.
    pub end_of_stream: bool,
    /// Elements that were not rolled back, with reasons.
    #[serde(default)]
    pub skipped_rollback_items: Vec<SkippedRollbackItem>,
}

/// An element excluded from auto-rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedRollbackItem {
    pub element: String,
    pub reason: String,
}

/// Snapshot of the failed instance emitted as the exclusive boundary between
/// the failed phase and the rollback phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreRollbackStateMessage {
    pub instance_id: String,
    pub state: InstanceSnapshot,
    pub snapshot_timestamp: DateTime<Utc>,
}

/// How change staging classified an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeClassification {
    New,
    Modified,
    Unchanged,
    Removed,
    Recreate,
}

/// Per-resource message streamed while staging changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceChangesMessage {
    pub resource_name: String,
    pub classification: ChangeClassification,
    #[serde(default)]
    pub changes: Option<ResourceChanges>,
}

/// Per-link message streamed while staging changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkChangesMessage {
    pub link_name: String,
    pub classification: ChangeClassification,
    #[serde(default)]
    pub changes: Option<LinkChanges>,
}

/// Per-child message streamed while staging changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildChangesMessage {
    pub child_name: String,
    pub classification: ChangeClassification,
    #[serde(default)]
    pub changes: Option<BlueprintChanges>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InstanceState;

    #[test]
    fn test_deploy_event_wire_format() {
        let event = DeployEvent::Finish(DeploymentFinishedMessage {
            instance_id: "inst-1".into(),
            status: InstanceStatus::Deployed,
            failure_reasons: vec![],
            finish_timestamp: Utc::now(),
            durations: None,
            end_of_stream: true,
            skipped_rollback_items: vec![],
        });

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "finish");
        assert_eq!(wire["message"]["instance_id"], "inst-1");

        let round_tripped: DeployEvent = serde_json::from_value(wire).unwrap();
        assert!(matches!(round_tripped, DeployEvent::Finish(_)));
    }

    #[test]
    fn test_deploy_event_type_tags() {
        let pre_rollback = DeployEvent::PreRollbackState(PreRollbackStateMessage {
            instance_id: "inst-1".into(),
            state: InstanceSnapshot {
                instance: InstanceState::default(),
                children: Default::default(),
            },
            snapshot_timestamp: Utc::now(),
        });
        let wire = serde_json::to_value(&pre_rollback).unwrap();
        assert_eq!(wire["type"], "preRollbackState");

        let resource_update = DeployEvent::ResourceUpdate(ResourceDeployUpdateMessage {
            instance_id: "inst-1".into(),
            resource_id: "res-1".into(),
            resource_name: "ordersTable".into(),
            group: Some(0),
            status: ResourceStatus::Creating,
            precise_status: PreciseResourceStatus::Creating,
            failure_reasons: vec![],
            can_retry: false,
            attempt: 1,
            update_timestamp: Utc::now(),
            durations: None,
        });
        let wire = serde_json::to_value(&resource_update).unwrap();
        assert_eq!(wire["type"], "resourceUpdate");
    }
}
