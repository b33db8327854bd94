//! Change set types produced by change staging.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The computed diff between a resolved blueprint and the persisted state of
/// an instance. Drives both deploy and destroy.
///
/// Invariant: an element name appears in at most one category per category
/// group (e.g. a resource is new, changed, removed or unchanged, never two of
/// those).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlueprintChanges {
    #[serde(default)]
    pub new_resources: HashMap<String, ResourceChanges>,
    #[serde(default)]
    pub resource_changes: HashMap<String, ResourceChanges>,
    #[serde(default)]
    pub removed_resources: Vec<String>,
    #[serde(default)]
    pub unchanged_resources: Vec<String>,

    #[serde(default)]
    pub new_links: HashMap<String, LinkChanges>,
    #[serde(default)]
    pub link_changes: HashMap<String, LinkChanges>,
    #[serde(default)]
    pub removed_links: Vec<String>,

    #[serde(default)]
    pub new_children: HashMap<String, BlueprintChanges>,
    /// Recursive change sets for children that already exist.
    #[serde(default)]
    pub child_changes: HashMap<String, BlueprintChanges>,
    /// Children that must be torn down and re-deployed.
    #[serde(default)]
    pub recreate_children: Vec<String>,
    #[serde(default)]
    pub removed_children: Vec<String>,

    #[serde(default)]
    pub new_exports: HashMap<String, ExportChanges>,
    #[serde(default)]
    pub export_changes: HashMap<String, ExportChanges>,
    #[serde(default)]
    pub removed_exports: Vec<String>,
    #[serde(default)]
    pub unchanged_exports: Vec<String>,

    /// Field paths that cannot be resolved until deploy time, prefixed with
    /// the owning element, e.g. `resources.saveOrderFunction.spec.handler`.
    #[serde(default)]
    pub resolve_on_deploy: Vec<String>,
}

impl BlueprintChanges {
    /// Number of elements the orchestrator will dispatch for the deploy
    /// phase of this change set (direct children only; nested child change
    /// sets are accounted for by the child's own orchestration run).
    pub fn deploy_element_count(&self) -> usize {
        self.new_resources.len()
            + self.resource_changes.len()
            + self.new_links.len()
            + self.link_changes.len()
            + self.new_children.len()
            + self.child_changes.len()
            + self.recreate_children.len()
    }

    /// Number of elements the orchestrator will dispatch for the remove
    /// phase of this change set.
    pub fn removal_element_count(&self) -> usize {
        self.removed_resources.len()
            + self.removed_links.len()
            + self.removed_children.len()
            + self.recreate_children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deploy_element_count() == 0 && self.removal_element_count() == 0
    }

    /// Whether the named resource is staged for deployment (new, changed or
    /// recreated).
    pub fn deploys_resource(&self, name: &str) -> bool {
        self.new_resources.contains_key(name) || self.resource_changes.contains_key(name)
    }

    pub fn deploys_child(&self, name: &str) -> bool {
        self.new_children.contains_key(name)
            || self.child_changes.contains_key(name)
            || self.recreate_children.iter().any(|child| child == name)
    }
}

/// A single field-level change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field_path: String,
    #[serde(default)]
    pub prev_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
}

/// Changes staged for a single resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceChanges {
    /// Provider resource type the changes apply to.
    #[serde(rename = "type", default)]
    pub resource_type: String,
    #[serde(default)]
    pub new_fields: Vec<FieldChange>,
    #[serde(default)]
    pub modified_fields: Vec<FieldChange>,
    #[serde(default)]
    pub removed_fields: Vec<String>,
    #[serde(default)]
    pub unchanged_fields: Vec<String>,
    /// Field paths whose final values are only known at deploy time.
    #[serde(default)]
    pub field_changes_known_on_deploy: Vec<String>,
    /// Set when the resource must be torn down and re-created, e.g. a
    /// dependency it relied on was removed from the blueprint.
    #[serde(default)]
    pub must_recreate: bool,
}

impl ResourceChanges {
    pub fn has_changes(&self) -> bool {
        !self.new_fields.is_empty()
            || !self.modified_fields.is_empty()
            || !self.removed_fields.is_empty()
            || self.must_recreate
    }
}

/// Changes staged for a single link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkChanges {
    #[serde(default)]
    pub resource_a: String,
    #[serde(default)]
    pub resource_b: String,
    #[serde(default)]
    pub new_fields: Vec<FieldChange>,
    #[serde(default)]
    pub modified_fields: Vec<FieldChange>,
    #[serde(default)]
    pub removed_fields: Vec<String>,
    #[serde(default)]
    pub unchanged_fields: Vec<String>,
    #[serde(default)]
    pub field_changes_known_on_deploy: Vec<String>,
}

/// Changes staged for an exported field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportChanges {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub prev_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    /// Set when the export value is only known at deploy time.
    #[serde(default)]
    pub known_on_deploy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_counts() {
        let mut changes = BlueprintChanges::default();
        changes
            .new_resources
            .insert("ordersTable_0".into(), ResourceChanges::default());
        changes
            .resource_changes
            .insert("saveOrderFunction".into(), ResourceChanges::default());
        changes.removed_resources.push("invoicesTable".into());
        changes
            .new_links
            .insert("saveOrderFunction::ordersTable_0".into(), LinkChanges::default());
        changes.recreate_children.push("networking".into());

        assert_eq!(changes.deploy_element_count(), 4);
        assert_eq!(changes.removal_element_count(), 2);
        assert!(!changes.is_empty());
        assert!(changes.deploys_resource("ordersTable_0"));
        assert!(changes.deploys_child("networking"));
        assert!(!changes.deploys_resource("invoicesTable"));
    }
}
