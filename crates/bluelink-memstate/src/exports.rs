//! Export and metadata records.

use crate::MemoryStateContainer;
use async_trait::async_trait;
use bluelink_core::state::ExportState;
use bluelink_core::store::{ExportsContainer, MetadataContainer};
use bluelink_core::Result;
use serde_json::Value;
use std::collections::HashMap;

#[async_trait]
impl ExportsContainer for MemoryStateContainer {
    async fn get_all(&self, instance_id: &str) -> Result<HashMap<String, ExportState>> {
        Ok(self
            .exports
            .get(instance_id)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn save_all(
        &self,
        instance_id: &str,
        exports: HashMap<String, ExportState>,
    ) -> Result<()> {
        self.exports.insert(instance_id.to_string(), exports);
        Ok(())
    }

    async fn remove_all(&self, instance_id: &str) -> Result<()> {
        self.exports.remove(instance_id);
        Ok(())
    }
}

#[async_trait]
impl MetadataContainer for MemoryStateContainer {
    async fn get(&self, instance_id: &str) -> Result<Value> {
        Ok(self
            .metadata
            .get(instance_id)
            .map(|entry| entry.clone())
            .unwrap_or(Value::Null))
    }

    async fn save(&self, instance_id: &str, metadata: Value) -> Result<()> {
        self.metadata.insert(instance_id.to_string(), metadata);
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> Result<()> {
        self.metadata.remove(instance_id);
        Ok(())
    }
}
