//! In-memory state container for Bluelink.
//!
//! Implements every `StateContainer` sub-trait over concurrent maps. Used as
//! the backend for engine tests and as a reference implementation for
//! embedders writing durable stores. Not a durability story.

mod children;
mod exports;
mod instances;
mod links;
mod resources;

use bluelink_core::drift::{LinkDriftState, ResourceDriftState};
use bluelink_core::state::{ExportState, InstanceState, LinkState, ResourceState};
use bluelink_core::store::{
    ChildrenContainer, ExportsContainer, InstancesContainer, LinksContainer, MetadataContainer,
    ResourcesContainer, StateContainer,
};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;

/// Key into the per-instance entity maps.
type EntityKey = (String, String);

/// Memory-backed state container.
///
/// Instance records are stored with their nested entity maps empty; entities
/// live in their own maps and `instances().get` re-assembles the full state.
#[derive(Default)]
pub struct MemoryStateContainer {
    pub(crate) instances: DashMap<String, InstanceState>,
    pub(crate) instance_names: DashMap<String, String>,
    pub(crate) resources: DashMap<EntityKey, ResourceState>,
    pub(crate) resource_drift: DashMap<EntityKey, ResourceDriftState>,
    pub(crate) links: DashMap<EntityKey, LinkState>,
    pub(crate) link_drift: DashMap<EntityKey, LinkDriftState>,
    pub(crate) exports: DashMap<String, HashMap<String, ExportState>>,
    pub(crate) metadata: DashMap<String, Value>,
}

impl MemoryStateContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn entity_key(instance_id: &str, name: &str) -> EntityKey {
        (instance_id.to_string(), name.to_string())
    }

    /// Assemble a fully hydrated instance state from the entity maps.
    pub(crate) fn assemble(&self, record: &InstanceState) -> InstanceState {
        let mut state = record.clone();
        state.resources = self
            .resources
            .iter()
            .filter(|entry| entry.key().0 == state.instance_id)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        state.links = self
            .links
            .iter()
            .filter(|entry| entry.key().0 == state.instance_id)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        state.exports = self
            .exports
            .get(&state.instance_id)
            .map(|exports| exports.clone())
            .unwrap_or_default();
        if let Some(metadata) = self.metadata.get(&state.instance_id) {
            state.metadata = metadata.clone();
        }
        state
    }

    /// Split a hydrated instance state into its base record and entities.
    pub(crate) fn distribute(&self, mut state: InstanceState) {
        let instance_id = state.instance_id.clone();
        for (name, resource) in state.resources.drain() {
            self.resources
                .insert(Self::entity_key(&instance_id, &name), resource);
        }
        for (name, link) in state.links.drain() {
            self.links
                .insert(Self::entity_key(&instance_id, &name), link);
        }
        if !state.exports.is_empty() {
            self.exports
                .insert(instance_id.clone(), std::mem::take(&mut state.exports));
        }
        if !state.metadata.is_null() {
            self.metadata
                .insert(instance_id.clone(), state.metadata.clone());
        }
        if let Some(name) = &state.instance_name {
            self.instance_names.insert(name.clone(), instance_id.clone());
        }
        self.instances.insert(instance_id, state);
    }

    pub(crate) fn drop_instance_entities(&self, instance_id: &str) {
        self.resources.retain(|key, _| key.0 != instance_id);
        self.resource_drift.retain(|key, _| key.0 != instance_id);
        self.links.retain(|key, _| key.0 != instance_id);
        self.link_drift.retain(|key, _| key.0 != instance_id);
        self.exports.remove(instance_id);
        self.metadata.remove(instance_id);
    }
}

impl StateContainer for MemoryStateContainer {
    fn instances(&self) -> &dyn InstancesContainer {
        self
    }

    // Sub-containers all resolve to the same backing maps.

    fn resources(&self) -> &dyn ResourcesContainer {
        self
    }

    fn links(&self) -> &dyn LinksContainer {
        self
    }

    fn children(&self) -> &dyn ChildrenContainer {
        self
    }

    fn exports(&self) -> &dyn ExportsContainer {
        self
    }

    fn metadata(&self) -> &dyn MetadataContainer {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_core::state::{link_name, resource_data_mapping_key};
    use bluelink_core::status::InstanceStatus;
    use bluelink_core::store::InstanceStatusInfo;
    use serde_json::json;

    fn seeded_instance() -> InstanceState {
        let mut instance = InstanceState {
            instance_id: "inst-1".into(),
            instance_name: Some("BlueprintInstance1".into()),
            status: InstanceStatus::Deployed,
            metadata: json!({"build": "v1"}),
            ..Default::default()
        };
        instance.resources.insert(
            "ordersTable".into(),
            ResourceState {
                resource_id: "res-1".into(),
                name: "ordersTable".into(),
                resource_type: "aws/dynamodb/table".into(),
                instance_id: "inst-1".into(),
                spec_data: json!({"tableName": "orders"}),
                ..Default::default()
            },
        );
        let name = link_name("saveOrderFunction", "ordersTable");
        instance.links.insert(
            name.clone(),
            LinkState {
                link_id: "link-1".into(),
                name,
                instance_id: "inst-1".into(),
                resource_data_mappings: HashMap::from([(
                    resource_data_mapping_key("ordersTable", "spec.tableName"),
                    "ordersTable.tableName".to_string(),
                )]),
                ..Default::default()
            },
        );
        instance
    }

    #[tokio::test]
    async fn test_save_and_reassemble_instance() {
        let container = MemoryStateContainer::new();
        let instance = seeded_instance();
        container.instances().save(instance).await.unwrap();

        let loaded = container.instances().get("inst-1").await.unwrap();
        assert_eq!(loaded.resources.len(), 1);
        assert_eq!(loaded.links.len(), 1);
        assert_eq!(loaded.metadata, json!({"build": "v1"}));

        let by_name = container
            .instances()
            .lookup_id_by_name("BlueprintInstance1")
            .await
            .unwrap();
        assert_eq!(by_name.as_deref(), Some("inst-1"));
    }

    #[tokio::test]
    async fn test_update_status_is_partial() {
        let container = MemoryStateContainer::new();
        container
            .instances()
            .save(seeded_instance())
            .await
            .unwrap();

        container
            .instances()
            .update_status(
                "inst-1",
                InstanceStatusInfo {
                    status: InstanceStatus::Destroying,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let loaded = container.instances().get("inst-1").await.unwrap();
        assert_eq!(loaded.status, InstanceStatus::Destroying);
        assert_eq!(loaded.instance_name.as_deref(), Some("BlueprintInstance1"));
    }

    #[tokio::test]
    async fn test_remove_instance_drops_entities() {
        let container = MemoryStateContainer::new();
        container
            .instances()
            .save(seeded_instance())
            .await
            .unwrap();

        let removed = container.instances().remove("inst-1").await.unwrap();
        assert_eq!(removed.resources.len(), 1);
        assert!(container.instances().get("inst-1").await.is_err());
        assert!(container.resources().list("inst-1").await.unwrap().is_empty());
        assert!(container.links().list("inst-1").await.unwrap().is_empty());
        assert!(container
            .instances()
            .lookup_id_by_name("BlueprintInstance1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_with_resource_data_mappings() {
        let container = MemoryStateContainer::new();
        container
            .instances()
            .save(seeded_instance())
            .await
            .unwrap();

        let referencing = container
            .links()
            .list_with_resource_data_mappings("inst-1", "ordersTable")
            .await
            .unwrap();
        assert_eq!(referencing.len(), 1);

        let unrelated = container
            .links()
            .list_with_resource_data_mappings("inst-1", "invoicesTable")
            .await
            .unwrap();
        assert!(unrelated.is_empty());
    }

    #[tokio::test]
    async fn test_child_attachments() {
        let container = MemoryStateContainer::new();
        container
            .instances()
            .save(seeded_instance())
            .await
            .unwrap();
        container
            .instances()
            .save(InstanceState {
                instance_id: "inst-2".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        container
            .children()
            .attach("inst-1", "networking", "inst-2")
            .await
            .unwrap();
        let child = container.children().get("inst-1", "networking").await.unwrap();
        assert_eq!(child.instance_id, "inst-2");

        container.children().detach("inst-1", "networking").await.unwrap();
        assert!(container.children().get("inst-1", "networking").await.is_err());
    }
}
