//! Drift checker seam and drift records.
//!
//! Drift detection internals live outside the engine; the engine consumes
//! this interface during change staging and reconciliation.

use crate::changes::FieldChange;
use crate::state::{InstanceState, LinkState, ResourceState};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Persisted record of drift detected on a resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDriftState {
    pub instance_id: String,
    pub resource_id: String,
    pub resource_name: String,
    /// The externally observed spec.
    #[serde(default)]
    pub spec_data: Value,
    /// Field-level differences from the persisted spec.
    #[serde(default)]
    pub difference: Vec<FieldChange>,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
}

/// Persisted record of drift detected on a link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkDriftState {
    pub instance_id: String,
    pub link_id: String,
    pub link_name: String,
    /// The externally observed link data.
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub difference: Vec<FieldChange>,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
}

/// Externally observed state of a resource whose last operation was
/// interrupted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterruptedResourceCheck {
    pub resource_name: String,
    /// Whether the resource exists externally at all.
    pub exists: bool,
    /// The externally observed spec, when the resource exists.
    #[serde(default)]
    pub external_spec: Option<Value>,
    /// Whether the provider reports the resource as stabilised.
    #[serde(default)]
    pub stabilised: bool,
}

/// Drift detection seam consumed by change staging and reconciliation.
#[async_trait]
pub trait DriftChecker: Send + Sync {
    /// Check every resource of the instance, returning drift keyed by
    /// resource name.
    async fn check_drift_with_state(
        &self,
        instance: &InstanceState,
    ) -> Result<HashMap<String, ResourceDriftState>>;

    async fn check_resource_drift(
        &self,
        resource: &ResourceState,
    ) -> Result<Option<ResourceDriftState>>;

    async fn check_link_drift(&self, link: &LinkState) -> Result<Option<LinkDriftState>>;

    /// Observe the external state of every interrupted resource in the
    /// instance.
    async fn check_interrupted_resources_with_state(
        &self,
        instance: &InstanceState,
    ) -> Result<Vec<InterruptedResourceCheck>>;
}
