//! Resource records and drift entries.

use crate::MemoryStateContainer;
use async_trait::async_trait;
use bluelink_core::drift::ResourceDriftState;
use bluelink_core::state::ResourceState;
use bluelink_core::store::{ResourceStatusInfo, ResourcesContainer};
use bluelink_core::{Error, Result};

#[async_trait]
impl ResourcesContainer for MemoryStateContainer {
    async fn get(&self, instance_id: &str, resource_name: &str) -> Result<ResourceState> {
        self.resources
            .get(&Self::entity_key(instance_id, resource_name))
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::ResourceNotFound(resource_name.to_string()))
    }

    async fn list(&self, instance_id: &str) -> Result<Vec<ResourceState>> {
        Ok(self
            .resources
            .iter()
            .filter(|entry| entry.key().0 == instance_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn save(&self, state: ResourceState) -> Result<()> {
        self.resources
            .insert(Self::entity_key(&state.instance_id, &state.name), state);
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &str,
        resource_name: &str,
        info: ResourceStatusInfo,
    ) -> Result<()> {
        let mut entry = self
            .resources
            .get_mut(&Self::entity_key(instance_id, resource_name))
            .ok_or_else(|| Error::ResourceNotFound(resource_name.to_string()))?;
        entry.status = info.status;
        entry.precise_status = info.precise_status;
        if let Some(reasons) = info.failure_reasons {
            entry.failure_reasons = reasons;
        }
        if info.last_deployed_at.is_some() {
            entry.last_deployed_at = info.last_deployed_at;
        }
        if info.last_deploy_attempted_at.is_some() {
            entry.last_deploy_attempted_at = info.last_deploy_attempted_at;
        }
        if info.durations.is_some() {
            entry.durations = info.durations;
        }
        if let Some(drifted) = info.drifted {
            entry.drifted = drifted;
        }
        Ok(())
    }

    async fn remove(&self, instance_id: &str, resource_name: &str) -> Result<ResourceState> {
        let key = Self::entity_key(instance_id, resource_name);
        self.resource_drift.remove(&key);
        self.resources
            .remove(&key)
            .map(|(_, state)| state)
            .ok_or_else(|| Error::ResourceNotFound(resource_name.to_string()))
    }

    async fn save_drift(&self, drift: ResourceDriftState) -> Result<()> {
        self.resource_drift.insert(
            Self::entity_key(&drift.instance_id, &drift.resource_name),
            drift,
        );
        Ok(())
    }

    async fn get_drift(
        &self,
        instance_id: &str,
        resource_name: &str,
    ) -> Result<Option<ResourceDriftState>> {
        Ok(self
            .resource_drift
            .get(&Self::entity_key(instance_id, resource_name))
            .map(|entry| entry.clone()))
    }

    async fn remove_drift(&self, instance_id: &str, resource_name: &str) -> Result<()> {
        self.resource_drift
            .remove(&Self::entity_key(instance_id, resource_name));
        Ok(())
    }
}
