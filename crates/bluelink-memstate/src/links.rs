//! Link records and drift entries.

use crate::MemoryStateContainer;
use async_trait::async_trait;
use bluelink_core::drift::LinkDriftState;
use bluelink_core::state::{parse_resource_data_mapping_key, LinkState};
use bluelink_core::store::{LinkStatusInfo, LinksContainer};
use bluelink_core::{Error, Result};

#[async_trait]
impl LinksContainer for MemoryStateContainer {
    async fn get(&self, instance_id: &str, link_name: &str) -> Result<LinkState> {
        self.links
            .get(&Self::entity_key(instance_id, link_name))
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::LinkNotFound(link_name.to_string()))
    }

    async fn list(&self, instance_id: &str) -> Result<Vec<LinkState>> {
        Ok(self
            .links
            .iter()
            .filter(|entry| entry.key().0 == instance_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_with_resource_data_mappings(
        &self,
        instance_id: &str,
        resource_name: &str,
    ) -> Result<Vec<LinkState>> {
        Ok(self
            .links
            .iter()
            .filter(|entry| entry.key().0 == instance_id)
            .filter(|entry| {
                entry.value().resource_data_mappings.keys().any(|key| {
                    parse_resource_data_mapping_key(key)
                        .is_some_and(|(resource, _)| resource == resource_name)
                })
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn save(&self, state: LinkState) -> Result<()> {
        self.links
            .insert(Self::entity_key(&state.instance_id, &state.name), state);
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &str,
        link_name: &str,
        info: LinkStatusInfo,
    ) -> Result<()> {
        let mut entry = self
            .links
            .get_mut(&Self::entity_key(instance_id, link_name))
            .ok_or_else(|| Error::LinkNotFound(link_name.to_string()))?;
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

    async fn remove(&self, instance_id: &str, link_name: &str) -> Result<LinkState> {
        let key = Self::entity_key(instance_id, link_name);
        self.link_drift.remove(&key);
        self.links
            .remove(&key)
            .map(|(_, state)| state)
            .ok_or_else(|| Error::LinkNotFound(link_name.to_string()))
    }

    async fn save_drift(&self, drift: LinkDriftState) -> Result<()> {
        self.link_drift.insert(
            Self::entity_key(&drift.instance_id, &drift.link_name),
            drift,
        );
        Ok(())
    }

    async fn get_drift(
        &self,
        instance_id: &str,
        link_name: &str,
    ) -> Result<Option<LinkDriftState>> {
        Ok(self
            .link_drift
            .get(&Self::entity_key(instance_id, link_name))
            .map(|entry| entry.clone()))
    }

    async fn remove_drift(&self, instance_id: &str, link_name: &str) -> Result<()> {
        self.link_drift
            .remove(&Self::entity_key(instance_id, link_name));
        Ok(())
    }
}
