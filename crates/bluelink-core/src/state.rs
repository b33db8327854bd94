//! Persisted state types.

use crate::status::{
    InstanceStatus, IntermediaryResourceStatus, LinkStatus, PreciseLinkStatus,
    PreciseResourceStatus, ResourceStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Separator between the two endpoint names in a link name.
pub const LINK_NAME_SEPARATOR: &str = "::";

/// Canonical link name for the ordered pair of endpoint resources.
pub fn link_name(resource_a: &str, resource_b: &str) -> String {
    format!("{resource_a}{LINK_NAME_SEPARATOR}{resource_b}")
}

/// Split a link name back into its endpoint resource names.
pub fn parse_link_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(LINK_NAME_SEPARATOR)
        .filter(|(a, b)| !a.is_empty() && !b.is_empty())
}

/// Key into a link's resource data mappings:
/// `"{resourceName}::{resourceFieldPath}"`.
pub fn resource_data_mapping_key(resource_name: &str, field_path: &str) -> String {
    format!("{resource_name}{LINK_NAME_SEPARATOR}{field_path}")
}

/// Split a resource data mapping key into resource name and field path.
pub fn parse_resource_data_mapping_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(LINK_NAME_SEPARATOR)
        .filter(|(resource, path)| !resource.is_empty() && !path.is_empty())
}

/// The persisted state of a deployed blueprint instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceState {
    /// Globally unique instance id.
    pub instance_id: String,
    /// Optional unique human-friendly name.
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub status: InstanceStatus,
    /// Resource states keyed by logical resource name.
    #[serde(default)]
    pub resources: HashMap<String, ResourceState>,
    /// Link states keyed by `"{a}::{b}"`.
    #[serde(default)]
    pub links: HashMap<String, LinkState>,
    /// Child instance ids keyed by include name. Child instances are stored
    /// as their own records.
    #[serde(default)]
    pub child_instance_ids: HashMap<String, String>,
    #[serde(default)]
    pub exports: HashMap<String, ExportState>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_deploy_attempted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status_update_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub durations: Option<InstanceCompletionDurations>,
}

/// Durations recorded for an instance-level operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceCompletionDurations {
    /// Time spent expanding templates and building parallel groups.
    pub prepare_ms: Option<f64>,
    /// Total wall-clock time for the operation.
    pub total_ms: Option<f64>,
}

/// The persisted state of a single resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceState {
    /// Globally unique resource id.
    pub resource_id: String,
    /// Logical name within the blueprint, e.g. `ordersTable_0`.
    pub name: String,
    /// Template this resource was expanded from, when applicable.
    #[serde(default)]
    pub template_name: Option<String>,
    /// Provider resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Instance this resource belongs to.
    pub instance_id: String,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub precise_status: PreciseResourceStatus,
    /// Resolved spec including provider-computed output fields.
    #[serde(default)]
    pub spec_data: Value,
    #[serde(default)]
    pub depends_on_resources: Vec<String>,
    #[serde(default)]
    pub depends_on_children: Vec<String>,
    /// Whether the last drift check found the external state diverged.
    #[serde(default)]
    pub drifted: bool,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_deploy_attempted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub durations: Option<ResourceCompletionDurations>,
}

/// Durations recorded for a resource operation, including per-attempt
/// durations so retry history survives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCompletionDurations {
    /// Time until the provider reported config-complete.
    pub config_complete_ms: Option<f64>,
    /// Total time including stabilisation.
    pub total_ms: Option<f64>,
    /// Duration of each deploy attempt, in order.
    #[serde(default)]
    pub attempt_durations_ms: Vec<f64>,
}

/// The persisted state of a link between two resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkState {
    /// Globally unique link id.
    pub link_id: String,
    /// `"{resourceA}::{resourceB}"`.
    pub name: String,
    /// Instance this link belongs to.
    pub instance_id: String,
    #[serde(default)]
    pub status: LinkStatus,
    #[serde(default)]
    pub precise_status: PreciseLinkStatus,
    /// The link's merged per-side field graph produced by the link provider.
    #[serde(default)]
    pub data: Value,
    /// `"{resource}::{resourceFieldPath}" -> "{linkDataPath}"` mappings for
    /// resource fields written by this link. Reconciliation uses these to
    /// keep `data` consistent when an endpoint resource drifts.
    #[serde(default)]
    pub resource_data_mappings: HashMap<String, String>,
    /// External resources created and owned by the link, in creation order.
    #[serde(default)]
    pub intermediary_resource_states: Vec<IntermediaryResourceState>,
    #[serde(default)]
    pub drifted: bool,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_deploy_attempted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub durations: Option<LinkCompletionDurations>,
}

impl LinkState {
    /// Endpoint resource names, when the link name is well-formed.
    pub fn endpoints(&self) -> Option<(&str, &str)> {
        parse_link_name(&self.name)
    }
}

/// Durations recorded per link stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkCompletionDurations {
    pub resource_a_update_ms: Option<f64>,
    pub resource_b_update_ms: Option<f64>,
    pub intermediary_resources_update_ms: Option<f64>,
    pub total_ms: Option<f64>,
    /// Attempt durations per stage, keyed by stage in A/B/intermediaries
    /// order.
    #[serde(default)]
    pub attempt_durations_ms: [Vec<f64>; 3],
}

/// The state of an external resource owned by a link (e.g. an IAM policy).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntermediaryResourceState {
    pub resource_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub status: IntermediaryResourceStatus,
    #[serde(default)]
    pub spec_data: Value,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
}

/// A persisted exported value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportState {
    #[serde(rename = "type", default)]
    pub export_type: String,
    /// Field path the export was resolved from.
    pub field: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub description: Option<String>,
}

/// A recursive snapshot of an instance and its descendants, used for the
/// pre-rollback state message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance: InstanceState,
    /// Child snapshots keyed by include name.
    #[serde(default)]
    pub children: HashMap<String, InstanceSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_name_round_trip() {
        let name = link_name("saveOrderFunction", "ordersTable_0");
        assert_eq!(name, "saveOrderFunction::ordersTable_0");
        assert_eq!(
            parse_link_name(&name),
            Some(("saveOrderFunction", "ordersTable_0"))
        );
    }

    #[test]
    fn test_parse_link_name_rejects_malformed() {
        assert_eq!(parse_link_name("noSeparator"), None);
        assert_eq!(parse_link_name("::b"), None);
        assert_eq!(parse_link_name("a::"), None);
    }

    #[test]
    fn test_resource_data_mapping_key_round_trip() {
        let key = resource_data_mapping_key("resourceA", "spec.handler");
        assert_eq!(
            parse_resource_data_mapping_key(&key),
            Some(("resourceA", "spec.handler"))
        );
    }
}
