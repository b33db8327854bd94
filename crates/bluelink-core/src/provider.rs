//! Provider plugin interfaces.
//!
//! Providers supply the behaviour behind resource types and links. The
//! engine only ever talks to them through these narrow traits; it never
//! inspects provider internals.

use crate::changes::{LinkChanges, ResourceChanges};
use crate::state::{IntermediaryResourceState, LinkState, ResourceState};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for provider calls.
///
/// `Retryable` failures are looped with backoff per the provider's retry
/// policy. `Deploy`/`Destroy` failures are terminal for the element. Any
/// other error a provider surfaces must be wrapped in `Fatal` and aborts the
/// element without a retry.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("retryable provider failure: {message}")]
    Retryable { message: String },

    #[error("resource deploy failed: {message}")]
    Deploy { message: String },

    #[error("resource destroy failed: {message}")]
    Destroy { message: String },

    #[error("provider failure: {message}")]
    Fatal { message: String },
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        ProviderError::Retryable {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable { .. })
    }

    /// The failure reason recorded against the element.
    pub fn reason(&self) -> String {
        match self {
            ProviderError::Retryable { message }
            | ProviderError::Deploy { message }
            | ProviderError::Destroy { message }
            | ProviderError::Fatal { message } => message.clone(),
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Retry behaviour for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Jitter applied to each computed delay, as a percentage in `[0, 100]`.
    pub jitter_percent: f64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            jitter_percent: 10.0,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay before the given retry, with jitter.
    /// `attempt` is the 1-based attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        let jitter = self.jitter_percent.clamp(0.0, 100.0) / 100.0;
        let factor = if jitter > 0.0 {
            1.0 + rand::random_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_millis((base * factor).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed attempts.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// Input to a resource deploy call.
#[derive(Debug, Clone)]
pub struct ResourceDeployInput {
    pub instance_id: String,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    /// Fully resolved spec, resolve-on-deploy fields included.
    pub spec_data: Value,
    /// Persisted state from the previous deployment, when updating.
    pub current_state: Option<ResourceState>,
    /// Staged changes for this resource, when updating.
    pub changes: Option<ResourceChanges>,
}

/// Output of a successful resource deploy call.
#[derive(Debug, Clone, Default)]
pub struct ResourceDeployOutput {
    /// Provider-computed field values keyed by field path, merged into the
    /// resolved spec according to the provider's declared computed fields.
    pub computed_field_values: HashMap<String, Value>,
}

/// Input to a stabilisation check.
#[derive(Debug, Clone)]
pub struct HasStabilisedInput {
    pub instance_id: String,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub spec_data: Value,
}

/// Output of a stabilisation check.
#[derive(Debug, Clone, Default)]
pub struct HasStabilisedOutput {
    pub stabilised: bool,
}

/// Input to a resource destroy call.
#[derive(Debug, Clone)]
pub struct ResourceDestroyInput {
    pub instance_id: String,
    pub resource_state: ResourceState,
}

/// Behaviour behind a resource type.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// The resource type this provider implements.
    fn resource_type(&self) -> &str;

    /// Field paths whose values are computed by the provider during deploy
    /// (e.g. ARNs, generated ids). Only these paths are merged back from
    /// [`ResourceDeployOutput::computed_field_values`].
    fn computed_fields(&self) -> Vec<String> {
        Vec::new()
    }

    /// Dependency resource types that must be fully stabilised, not merely
    /// config-complete, before a resource of this type may deploy.
    fn stabilised_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn deploy(&self, input: ResourceDeployInput) -> ProviderResult<ResourceDeployOutput>;

    async fn has_stabilised(&self, input: HasStabilisedInput)
    -> ProviderResult<HasStabilisedOutput>;

    async fn destroy(&self, input: ResourceDestroyInput) -> ProviderResult<()>;
}

/// Input to the A/B endpoint stages of a link update.
#[derive(Debug, Clone)]
pub struct LinkUpdateResourceInput {
    pub instance_id: String,
    pub link_id: String,
    pub link_name: String,
    /// The endpoint being updated in this stage.
    pub resource: ResourceState,
    /// The opposite endpoint.
    pub other_resource: ResourceState,
    /// Link data accumulated so far (prior stages and previous deployments).
    pub link_data: Value,
    pub changes: Option<LinkChanges>,
}

/// Output of an endpoint stage.
#[derive(Debug, Clone, Default)]
pub struct LinkUpdateResourceOutput {
    /// Link data fields contributed by this stage, merged into the link's
    /// `data` document.
    pub link_data: Value,
    /// `"{resource}::{resourceFieldPath}" -> "{linkDataPath}"` mappings for
    /// resource spec fields this stage wrote.
    pub resource_data_mappings: HashMap<String, String>,
}

/// Input to the intermediary-resources stage.
#[derive(Debug, Clone)]
pub struct LinkUpdateIntermediariesInput {
    pub instance_id: String,
    pub link_id: String,
    pub link_name: String,
    pub resource_a: ResourceState,
    pub resource_b: ResourceState,
    pub link_data: Value,
    /// Intermediaries persisted by the previous deployment.
    pub current_intermediaries: Vec<IntermediaryResourceState>,
}

/// Output of the intermediary-resources stage.
#[derive(Debug, Clone, Default)]
pub struct LinkUpdateIntermediariesOutput {
    pub intermediary_resource_states: Vec<IntermediaryResourceState>,
    /// Link data contributed by the intermediaries stage.
    pub link_data: Value,
}

/// Input to the destroy stages of a link.
#[derive(Debug, Clone)]
pub struct LinkDestroyInput {
    pub instance_id: String,
    pub link_state: LinkState,
    pub resource_a: Option<ResourceState>,
    pub resource_b: Option<ResourceState>,
}

/// Behaviour behind a link between two resource types.
///
/// A link update runs `update_resource_a`, `update_resource_b` and
/// `update_intermediary_resources` in order; destroys run the destroy
/// analogues in reverse order.
#[async_trait]
pub trait LinkProvider: Send + Sync {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn update_resource_a(
        &self,
        input: LinkUpdateResourceInput,
    ) -> ProviderResult<LinkUpdateResourceOutput>;

    async fn update_resource_b(
        &self,
        input: LinkUpdateResourceInput,
    ) -> ProviderResult<LinkUpdateResourceOutput>;

    async fn update_intermediary_resources(
        &self,
        input: LinkUpdateIntermediariesInput,
    ) -> ProviderResult<LinkUpdateIntermediariesOutput>;

    async fn destroy_intermediary_resources(
        &self,
        input: LinkDestroyInput,
    ) -> ProviderResult<()>;

    async fn destroy_resource_b(&self, input: LinkDestroyInput) -> ProviderResult<()>;

    async fn destroy_resource_a(&self, input: LinkDestroyInput) -> ProviderResult<()>;
}

/// Lookup of providers by resource type and link endpoint type pair.
pub trait ProviderRegistry: Send + Sync {
    fn resource_provider(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>>;

    fn link_provider(
        &self,
        resource_type_a: &str,
        resource_type_b: &str,
    ) -> Option<Arc<dyn LinkProvider>>;
}

/// Map-backed registry for embedders that assemble providers up front.
#[derive(Default)]
pub struct StaticProviderRegistry {
    resources: HashMap<String, Arc<dyn ResourceProvider>>,
    links: HashMap<(String, String), Arc<dyn LinkProvider>>,
}

impl StaticProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource_provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.resources
            .insert(provider.resource_type().to_string(), provider);
        self
    }

    pub fn with_link_provider(
        mut self,
        resource_type_a: impl Into<String>,
        resource_type_b: impl Into<String>,
        provider: Arc<dyn LinkProvider>,
    ) -> Self {
        self.links
            .insert((resource_type_a.into(), resource_type_b.into()), provider);
        self
    }
}

impl ProviderRegistry for StaticProviderRegistry {
    fn resource_provider(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.resources.get(resource_type).cloned()
    }

    fn link_provider(
        &self,
        resource_type_a: &str,
        resource_type_b: &str,
    ) -> Option<Arc<dyn LinkProvider>> {
        self.links
            .get(&(resource_type_a.to_string(), resource_type_b.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_backoff_grows() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            jitter_percent: 0.0,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert!(policy.can_retry(3));
        assert!(!policy.can_retry(4));
    }

    #[test]
    fn test_retry_policy_jitter_bounds() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay_ms: 1000,
            jitter_percent: 20.0,
            backoff_multiplier: 1.0,
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1).as_millis() as f64;
            assert!((800.0..=1200.0).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_provider_error_taxonomy() {
        assert!(ProviderError::retryable("throttled").is_retryable());
        assert!(!ProviderError::Deploy { message: "bad spec".into() }.is_retryable());
        assert_eq!(
            ProviderError::Fatal { message: "boom".into() }.reason(),
            "boom"
        );
    }
}
