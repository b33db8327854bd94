//! State container traits — the persistence seam.
//!
//! The engine never talks to a database directly; it drives these traits and
//! treats each call as transactional enough for the entity it touches.

use crate::drift::{LinkDriftState, ResourceDriftState};
use crate::state::{
    ExportState, InstanceCompletionDurations, InstanceState, LinkCompletionDurations, LinkState,
    ResourceCompletionDurations, ResourceState,
};
use crate::status::{
    InstanceStatus, LinkStatus, PreciseLinkStatus, PreciseResourceStatus, ResourceStatus,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Facade over the per-entity containers of a state store.
pub trait StateContainer: Send + Sync {
    fn instances(&self) -> &dyn InstancesContainer;
    fn resources(&self) -> &dyn ResourcesContainer;
    fn links(&self) -> &dyn LinksContainer;
    fn children(&self) -> &dyn ChildrenContainer;
    fn exports(&self) -> &dyn ExportsContainer;
    fn metadata(&self) -> &dyn MetadataContainer;
}

/// Partial status update for an instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceStatusInfo {
    pub status: InstanceStatus,
    pub last_status_update_at: Option<DateTime<Utc>>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub last_deploy_attempted_at: Option<DateTime<Utc>>,
    pub durations: Option<InstanceCompletionDurations>,
}

#[async_trait]
pub trait InstancesContainer: Send + Sync {
    async fn get(&self, instance_id: &str) -> Result<InstanceState>;

    /// Resolve a unique instance name to its id, if the name is known.
    async fn lookup_id_by_name(&self, instance_name: &str) -> Result<Option<String>>;

    async fn save(&self, state: InstanceState) -> Result<()>;

    async fn update_status(&self, instance_id: &str, info: InstanceStatusInfo) -> Result<()>;

    /// Remove the instance record and everything attached to it.
    async fn remove(&self, instance_id: &str) -> Result<InstanceState>;
}

/// Partial status update for a resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceStatusInfo {
    pub status: ResourceStatus,
    pub precise_status: PreciseResourceStatus,
    /// Replaces the persisted failure reasons when set.
    pub failure_reasons: Option<Vec<String>>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub last_deploy_attempted_at: Option<DateTime<Utc>>,
    pub durations: Option<ResourceCompletionDurations>,
    pub drifted: Option<bool>,
}

#[async_trait]
pub trait ResourcesContainer: Send + Sync {
    async fn get(&self, instance_id: &str, resource_name: &str) -> Result<ResourceState>;

    async fn list(&self, instance_id: &str) -> Result<Vec<ResourceState>>;

    async fn save(&self, state: ResourceState) -> Result<()>;

    async fn update_status(
        &self,
        instance_id: &str,
        resource_name: &str,
        info: ResourceStatusInfo,
    ) -> Result<()>;

    async fn remove(&self, instance_id: &str, resource_name: &str) -> Result<ResourceState>;

    async fn save_drift(&self, drift: ResourceDriftState) -> Result<()>;

    async fn get_drift(
        &self,
        instance_id: &str,
        resource_name: &str,
    ) -> Result<Option<ResourceDriftState>>;

    async fn remove_drift(&self, instance_id: &str, resource_name: &str) -> Result<()>;
}

/// Partial status update for a link.
#[derive(Debug, Clone, Default)]
pub struct LinkStatusInfo {
    pub status: LinkStatus,
    pub precise_status: PreciseLinkStatus,
    pub failure_reasons: Option<Vec<String>>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub last_deploy_attempted_at: Option<DateTime<Utc>>,
    pub durations: Option<LinkCompletionDurations>,
    pub drifted: Option<bool>,
}

#[async_trait]
pub trait LinksContainer: Send + Sync {
    async fn get(&self, instance_id: &str, link_name: &str) -> Result<LinkState>;

    async fn list(&self, instance_id: &str) -> Result<Vec<LinkState>>;

    /// Links in the instance whose resource data mappings reference the
    /// given resource. Reconciliation uses this to propagate accepted
    /// external state into link data.
    async fn list_with_resource_data_mappings(
        &self,
        instance_id: &str,
        resource_name: &str,
    ) -> Result<Vec<LinkState>>;

    async fn save(&self, state: LinkState) -> Result<()>;

    async fn update_status(
        &self,
        instance_id: &str,
        link_name: &str,
        info: LinkStatusInfo,
    ) -> Result<()>;

    async fn remove(&self, instance_id: &str, link_name: &str) -> Result<LinkState>;

    async fn save_drift(&self, drift: LinkDriftState) -> Result<()>;

    async fn get_drift(
        &self,
        instance_id: &str,
        link_name: &str,
    ) -> Result<Option<LinkDriftState>>;

    async fn remove_drift(&self, instance_id: &str, link_name: &str) -> Result<()>;
}

#[async_trait]
pub trait ChildrenContainer: Send + Sync {
    /// Resolve and fetch the child instance attached under `child_name`.
    async fn get(&self, instance_id: &str, child_name: &str) -> Result<InstanceState>;

    /// `(child name, child instance id)` pairs attached to the instance.
    async fn list(&self, instance_id: &str) -> Result<Vec<(String, String)>>;

    async fn attach(
        &self,
        parent_instance_id: &str,
        child_name: &str,
        child_instance_id: &str,
    ) -> Result<()>;

    async fn detach(&self, parent_instance_id: &str, child_name: &str) -> Result<()>;
}

#[async_trait]
pub trait ExportsContainer: Send + Sync {
    async fn get_all(&self, instance_id: &str) -> Result<HashMap<String, ExportState>>;

    async fn save_all(
        &self,
        instance_id: &str,
        exports: HashMap<String, ExportState>,
    ) -> Result<()>;

    async fn remove_all(&self, instance_id: &str) -> Result<()>;
}

#[async_trait]
pub trait MetadataContainer: Send + Sync {
    async fn get(&self, instance_id: &str) -> Result<Value>;

    async fn save(&self, instance_id: &str, metadata: Value) -> Result<()>;

    async fn remove(&self, instance_id: &str) -> Result<()>;
}
