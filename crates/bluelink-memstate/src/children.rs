//! Parent/child instance attachments.

use crate::MemoryStateContainer;
use async_trait::async_trait;
use bluelink_core::state::InstanceState;
use bluelink_core::store::{ChildrenContainer, InstancesContainer};
use bluelink_core::{Error, Result};

#[async_trait]
impl ChildrenContainer for MemoryStateContainer {
    async fn get(&self, instance_id: &str, child_name: &str) -> Result<InstanceState> {
        let child_instance_id = {
            let record = self
                .instances
                .get(instance_id)
                .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
            record
                .child_instance_ids
                .get(child_name)
                .cloned()
                .ok_or_else(|| Error::InstanceNotFound(child_name.to_string()))?
        };
        InstancesContainer::get(self, &child_instance_id).await
    }

    async fn list(&self, instance_id: &str) -> Result<Vec<(String, String)>> {
        let record = self
            .instances
            .get(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        Ok(record
            .child_instance_ids
            .iter()
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect())
    }

    async fn attach(
        &self,
        parent_instance_id: &str,
        child_name: &str,
        child_instance_id: &str,
    ) -> Result<()> {
        let mut record = self
            .instances
            .get_mut(parent_instance_id)
            .ok_or_else(|| Error::InstanceNotFound(parent_instance_id.to_string()))?;
        record
            .child_instance_ids
            .insert(child_name.to_string(), child_instance_id.to_string());
        Ok(())
    }

    async fn detach(&self, parent_instance_id: &str, child_name: &str) -> Result<()> {
        let mut record = self
            .instances
            .get_mut(parent_instance_id)
            .ok_or_else(|| Error::InstanceNotFound(parent_instance_id.to_string()))?;
        record.child_instance_ids.remove(child_name);
        Ok(())
    }
}
