//! Instance records.

use crate::MemoryStateContainer;
use async_trait::async_trait;
use bluelink_core::state::InstanceState;
use bluelink_core::store::{InstanceStatusInfo, InstancesContainer};
use bluelink_core::{Error, Result};

#[async_trait]
impl InstancesContainer for MemoryStateContainer {
    async fn get(&self, instance_id: &str) -> Result<InstanceState> {
        let record = self
            .instances
            .get(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        Ok(self.assemble(&record))
    }

    async fn lookup_id_by_name(&self, instance_name: &str) -> Result<Option<String>> {
        Ok(self
            .instance_names
            .get(instance_name)
            .map(|id| id.clone()))
    }

    async fn save(&self, state: InstanceState) -> Result<()> {
        self.distribute(state);
        Ok(())
    }

    async fn update_status(&self, instance_id: &str, info: InstanceStatusInfo) -> Result<()> {
        let mut record = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        record.status = info.status;
        if info.last_status_update_at.is_some() {
            record.last_status_update_at = info.last_status_update_at;
        }
        if info.last_deployed_at.is_some() {
            record.last_deployed_at = info.last_deployed_at;
        }
        if info.last_deploy_attempted_at.is_some() {
            record.last_deploy_attempted_at = info.last_deploy_attempted_at;
        }
        if info.durations.is_some() {
            record.durations = info.durations;
        }
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> Result<InstanceState> {
        let (_, record) = self
            .instances
            .remove(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        let state = self.assemble(&record);
        self.drop_instance_entities(instance_id);
        if let Some(name) = &record.instance_name {
            self.instance_names.remove(name);
        }
        Ok(state)
    }
}
