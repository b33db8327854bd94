//! Shared test fixtures: stub resolvers, providers and a container harness
//! backed by the in-memory state container.

use crate::{BlueprintContainer, ContainerServices, StabilityPollingConfig};
use async_trait::async_trait;
use bluelink_core::error::{Error, Result};
use bluelink_core::provider::{
    HasStabilisedInput, HasStabilisedOutput, LinkDestroyInput, LinkProvider,
    LinkUpdateIntermediariesInput, LinkUpdateIntermediariesOutput, LinkUpdateResourceInput,
    LinkUpdateResourceOutput, ProviderError, ProviderResult, ResourceDeployInput,
    ResourceDeployOutput, ResourceDestroyInput, ResourceProvider, RetryPolicy,
    StaticProviderRegistry,
};
use bluelink_core::resolve::{
    BlueprintLoader, BlueprintParams, ChildBlueprintInfo, ChildResolver, LinkIntent, LinkOracle,
    ResolveStage, ResolvedExport, ResolvedInclude, ResolvedResource, SubstitutionResolver,
    TemplateItemContext,
};
use bluelink_core::schema::{Blueprint, ExportDef, IncludeDef, ResourceDef};
use bluelink_core::state::IntermediaryResourceState;
use bluelink_core::values::{flatten_leaves, inject_path};
use bluelink_memstate::MemoryStateContainer;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

pub(crate) fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn logged_calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub(crate) fn blueprint_with_resources(
    resources: Vec<(&str, &str, Option<Value>)>,
) -> Blueprint {
    let mut blueprint = Blueprint::default();
    for (name, resource_type, each) in resources {
        blueprint.resources.insert(
            name.to_string(),
            ResourceDef {
                resource_type: resource_type.to_string(),
                each,
                depends_on: Vec::new(),
                spec: json!({}),
                metadata: Value::Null,
            },
        );
    }
    blueprint
}

/// Substitution resolver stub. Leaf strings of the form `${...}` count as
/// substitutions: they are reported unresolved during change staging and
/// replaced with `resolved::<expr>` during deployment.
#[derive(Default)]
pub(crate) struct StubResolver;

fn substitution_paths(spec: &Value) -> Vec<String> {
    flatten_leaves(spec)
        .into_iter()
        .filter(|(_, value)| {
            value
                .as_str()
                .is_some_and(|text| text.starts_with("${") && text.ends_with('}'))
        })
        .map(|(path, _)| path)
        .collect()
}

#[async_trait]
impl SubstitutionResolver for StubResolver {
    async fn resolve_each(
        &self,
        _stage: ResolveStage,
        resource_name: &str,
        def: &ResourceDef,
        _params: &BlueprintParams,
    ) -> Result<Vec<Value>> {
        match &def.each {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(Error::ResolveFailed {
                element: resource_name.to_string(),
                message: "each must resolve to a list".to_string(),
            }),
        }
    }

    async fn resolve_resource(
        &self,
        stage: ResolveStage,
        _resource_name: &str,
        def: &ResourceDef,
        _params: &BlueprintParams,
        template: Option<&TemplateItemContext>,
    ) -> Result<ResolvedResource> {
        let mut spec = def.spec.clone();
        if let Some(template) = template {
            inject_path(&mut spec, "item", template.item.clone());
        }
        let substitutions = substitution_paths(&spec);
        match stage {
            ResolveStage::ChangeStaging => Ok(ResolvedResource {
                spec,
                metadata: def.metadata.clone(),
                unresolved_paths: substitutions,
            }),
            ResolveStage::Deployment => {
                for path in &substitutions {
                    inject_path(&mut spec, path, json!(format!("resolved::{path}")));
                }
                Ok(ResolvedResource {
                    spec,
                    metadata: def.metadata.clone(),
                    unresolved_paths: Vec::new(),
                })
            }
        }
    }

    async fn resolve_include(
        &self,
        _stage: ResolveStage,
        _include_name: &str,
        def: &IncludeDef,
        _params: &BlueprintParams,
    ) -> Result<ResolvedInclude> {
        Ok(ResolvedInclude {
            path: def.path.clone(),
            variables: def.variables.clone(),
            unresolved_paths: Vec::new(),
        })
    }

    async fn resolve_export(
        &self,
        stage: ResolveStage,
        _export_name: &str,
        def: &ExportDef,
        _params: &BlueprintParams,
    ) -> Result<ResolvedExport> {
        let is_substitution = def.field.starts_with("${");
        if is_substitution && stage == ResolveStage::ChangeStaging {
            return Ok(ResolvedExport {
                value: None,
                unresolved: true,
            });
        }
        let value = if is_substitution {
            json!(format!("resolved::{}", def.field))
        } else {
            Value::String(def.field.clone())
        };
        Ok(ResolvedExport {
            value: Some(value),
            unresolved: false,
        })
    }

    fn resource_references(&self, _resource_name: &str, _def: &ResourceDef) -> Vec<String> {
        Vec::new()
    }

    fn include_references(&self, _include_name: &str, _def: &IncludeDef) -> Vec<String> {
        Vec::new()
    }
}

/// Link oracle stub declaring a fixed set of intents.
pub(crate) struct StubOracle {
    intents: Vec<LinkIntent>,
}

impl StubOracle {
    pub fn new(pairs: Vec<(&str, &str)>) -> Self {
        Self {
            intents: pairs
                .into_iter()
                .map(|(resource_a, resource_b)| LinkIntent {
                    resource_a: resource_a.to_string(),
                    resource_b: resource_b.to_string(),
                })
                .collect(),
        }
    }
}

impl LinkOracle for StubOracle {
    fn links(&self, _blueprint: &Blueprint) -> Vec<LinkIntent> {
        self.intents.clone()
    }
}

/// Child resolver stub: the include path is the blueprint source key.
pub(crate) struct StubChildResolver;

#[async_trait]
impl ChildResolver for StubChildResolver {
    async fn resolve(
        &self,
        _include_name: &str,
        include: &ResolvedInclude,
        _params: &BlueprintParams,
    ) -> Result<ChildBlueprintInfo> {
        Ok(ChildBlueprintInfo::Source(include.path.clone()))
    }
}

/// Blueprint loader stub backed by a path -> blueprint map.
#[derive(Default)]
pub(crate) struct StubLoader {
    blueprints: HashMap<String, Blueprint>,
}

impl StubLoader {
    pub fn with_blueprint(mut self, path: &str, blueprint: Blueprint) -> Self {
        self.blueprints.insert(path.to_string(), blueprint);
        self
    }
}

#[async_trait]
impl BlueprintLoader for StubLoader {
    async fn load(
        &self,
        info: &ChildBlueprintInfo,
        _params: &BlueprintParams,
    ) -> Result<Blueprint> {
        let key = match info {
            ChildBlueprintInfo::Source(source) => source,
            ChildBlueprintInfo::AbsolutePath(path) => path,
        };
        self.blueprints
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ChildResolveFailed {
                include: key.clone(),
                message: "unknown child blueprint".to_string(),
            })
    }
}

/// Configurable resource provider for tests.
pub(crate) struct TestResourceProvider {
    resource_type: String,
    computed_fields: Vec<String>,
    computed_values: HashMap<String, Value>,
    stabilised_dependencies: Vec<String>,
    retry_policy: RetryPolicy,
    /// Fail this many leading deploy attempts with a retryable error.
    retryable_failures: AtomicU32,
    deploy_error: Option<ProviderError>,
    destroy_error: Option<ProviderError>,
    /// `None` means the resource never stabilises.
    stabilise_after_polls: Option<u32>,
    stabilise_counts: Mutex<HashMap<String, u32>>,
    calls: CallLog,
}

impl TestResourceProvider {
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            computed_fields: Vec::new(),
            computed_values: HashMap::new(),
            stabilised_dependencies: Vec::new(),
            retry_policy: RetryPolicy {
                max_retries: 2,
                base_delay_ms: 10,
                jitter_percent: 0.0,
                backoff_multiplier: 1.0,
            },
            retryable_failures: AtomicU32::new(0),
            deploy_error: None,
            destroy_error: None,
            stabilise_after_polls: Some(0),
            stabilise_counts: Mutex::new(HashMap::new()),
            calls: call_log(),
        }
    }

    pub fn with_computed_field(mut self, path: &str, value: Value) -> Self {
        self.computed_fields.push(path.to_string());
        self.computed_values.insert(path.to_string(), value);
        self
    }

    pub fn with_stabilised_dependencies(mut self, types: Vec<String>) -> Self {
        self.stabilised_dependencies = types;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn failing_first_attempts(self, attempts: u32) -> Self {
        self.retryable_failures.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn with_deploy_error(mut self, message: &str) -> Self {
        self.deploy_error = Some(ProviderError::Deploy {
            message: message.to_string(),
        });
        self
    }

    pub fn with_destroy_error(mut self, message: &str) -> Self {
        self.destroy_error = Some(ProviderError::Destroy {
            message: message.to_string(),
        });
        self
    }

    pub fn never_stabilising(mut self) -> Self {
        self.stabilise_after_polls = None;
        self
    }

    pub fn stabilising_after_polls(mut self, polls: u32) -> Self {
        self.stabilise_after_polls = Some(polls);
        self
    }

    pub fn with_call_log(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }
}

#[async_trait]
impl ResourceProvider for TestResourceProvider {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn computed_fields(&self) -> Vec<String> {
        self.computed_fields.clone()
    }

    fn stabilised_dependencies(&self) -> Vec<String> {
        self.stabilised_dependencies.clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    async fn deploy(&self, input: ResourceDeployInput) -> ProviderResult<ResourceDeployOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("deploy:{}", input.resource_name));
        if let Some(error) = &self.deploy_error {
            return Err(error.clone());
        }
        let remaining = self.retryable_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.retryable_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::retryable("transient provider failure"));
        }
        Ok(ResourceDeployOutput {
            computed_field_values: self.computed_values.clone(),
        })
    }

    async fn has_stabilised(
        &self,
        input: HasStabilisedInput,
    ) -> ProviderResult<HasStabilisedOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("stabilise:{}", input.resource_name));
        let Some(after) = self.stabilise_after_polls else {
            return Ok(HasStabilisedOutput { stabilised: false });
        };
        let mut counts = self.stabilise_counts.lock().unwrap();
        let count = counts.entry(input.resource_name.clone()).or_insert(0);
        *count += 1;
        Ok(HasStabilisedOutput {
            stabilised: *count > after,
        })
    }

    async fn destroy(&self, input: ResourceDestroyInput) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("destroy:{}", input.resource_state.name));
        match &self.destroy_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Configurable link provider for tests.
pub(crate) struct TestLinkProvider {
    data_a: Value,
    data_b: Value,
    data_intermediaries: Value,
    mappings_a: HashMap<String, String>,
    intermediaries: Vec<IntermediaryResourceState>,
    fail_stage_b: Option<ProviderError>,
    retry_policy: RetryPolicy,
    calls: CallLog,
}

impl TestLinkProvider {
    pub fn new() -> Self {
        Self {
            data_a: Value::Null,
            data_b: Value::Null,
            data_intermediaries: Value::Null,
            mappings_a: HashMap::new(),
            intermediaries: Vec::new(),
            fail_stage_b: None,
            retry_policy: RetryPolicy {
                max_retries: 1,
                base_delay_ms: 10,
                jitter_percent: 0.0,
                backoff_multiplier: 1.0,
            },
            calls: call_log(),
        }
    }

    pub fn with_stage_a(mut self, data: Value, mappings: HashMap<String, String>) -> Self {
        self.data_a = data;
        self.mappings_a = mappings;
        self
    }

    pub fn with_stage_b(mut self, data: Value) -> Self {
        self.data_b = data;
        self
    }

    pub fn with_intermediaries(
        mut self,
        data: Value,
        intermediaries: Vec<IntermediaryResourceState>,
    ) -> Self {
        self.data_intermediaries = data;
        self.intermediaries = intermediaries;
        self
    }

    pub fn failing_stage_b(mut self, message: &str) -> Self {
        self.fail_stage_b = Some(ProviderError::Deploy {
            message: message.to_string(),
        });
        self
    }

    pub fn with_call_log(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }
}

#[async_trait]
impl LinkProvider for TestLinkProvider {
    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    async fn update_resource_a(
        &self,
        input: LinkUpdateResourceInput,
    ) -> ProviderResult<LinkUpdateResourceOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("link:a:{}", input.link_name));
        Ok(LinkUpdateResourceOutput {
            link_data: self.data_a.clone(),
            resource_data_mappings: self.mappings_a.clone(),
        })
    }

    async fn update_resource_b(
        &self,
        input: LinkUpdateResourceInput,
    ) -> ProviderResult<LinkUpdateResourceOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("link:b:{}", input.link_name));
        if let Some(error) = &self.fail_stage_b {
            return Err(error.clone());
        }
        Ok(LinkUpdateResourceOutput {
            link_data: self.data_b.clone(),
            resource_data_mappings: HashMap::new(),
        })
    }

    async fn update_intermediary_resources(
        &self,
        input: LinkUpdateIntermediariesInput,
    ) -> ProviderResult<LinkUpdateIntermediariesOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("link:intermediaries:{}", input.link_name));
        Ok(LinkUpdateIntermediariesOutput {
            intermediary_resource_states: self.intermediaries.clone(),
            link_data: self.data_intermediaries.clone(),
        })
    }

    async fn destroy_intermediary_resources(
        &self,
        input: LinkDestroyInput,
    ) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("link:destroy:intermediaries:{}", input.link_state.name));
        Ok(())
    }

    async fn destroy_resource_b(&self, input: LinkDestroyInput) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("link:destroy:b:{}", input.link_state.name));
        Ok(())
    }

    async fn destroy_resource_a(&self, input: LinkDestroyInput) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("link:destroy:a:{}", input.link_state.name));
        Ok(())
    }
}

/// Registry with stock providers for the resource types used across tests.
pub(crate) fn test_registry() -> StaticProviderRegistry {
    StaticProviderRegistry::new()
        .with_resource_provider(Arc::new(TestResourceProvider::new("aws/dynamodb/table")))
        .with_resource_provider(Arc::new(TestResourceProvider::new("aws/lambda/function")))
        .with_resource_provider(Arc::new(TestResourceProvider::new("aws/sqs/queue")))
        .with_resource_provider(Arc::new(TestResourceProvider::new("aws/kinesis/stream")))
}

pub(crate) fn fast_polling() -> StabilityPollingConfig {
    StabilityPollingConfig {
        interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
    }
}

/// Drift checker stub with canned interrupted-resource observations.
#[derive(Default)]
pub(crate) struct StubDriftChecker {
    pub interrupted: Vec<bluelink_core::drift::InterruptedResourceCheck>,
}

#[async_trait]
impl bluelink_core::drift::DriftChecker for StubDriftChecker {
    async fn check_drift_with_state(
        &self,
        _instance: &bluelink_core::state::InstanceState,
    ) -> Result<HashMap<String, bluelink_core::drift::ResourceDriftState>> {
        Ok(HashMap::new())
    }

    async fn check_resource_drift(
        &self,
        _resource: &bluelink_core::state::ResourceState,
    ) -> Result<Option<bluelink_core::drift::ResourceDriftState>> {
        Ok(None)
    }

    async fn check_link_drift(
        &self,
        _link: &bluelink_core::state::LinkState,
    ) -> Result<Option<bluelink_core::drift::LinkDriftState>> {
        Ok(None)
    }

    async fn check_interrupted_resources_with_state(
        &self,
        _instance: &bluelink_core::state::InstanceState,
    ) -> Result<Vec<bluelink_core::drift::InterruptedResourceCheck>> {
        Ok(self.interrupted.clone())
    }
}

/// Drain a deploy stream until the terminal finish event.
pub(crate) async fn collect_events(
    mut stream: crate::DeployStream,
) -> Vec<bluelink_core::events::DeployEvent> {
    use bluelink_core::events::DeployEvent;
    let mut events = Vec::new();
    while let Some(event) = stream.events.recv().await {
        let end_of_stream = matches!(&event, DeployEvent::Finish(finish) if finish.end_of_stream);
        events.push(event);
        if end_of_stream {
            break;
        }
    }
    events
}

pub(crate) fn finish_messages(
    events: &[bluelink_core::events::DeployEvent],
) -> Vec<&bluelink_core::events::DeploymentFinishedMessage> {
    events
        .iter()
        .filter_map(|event| match event {
            bluelink_core::events::DeployEvent::Finish(finish) => Some(finish),
            _ => None,
        })
        .collect()
}

/// Everything a change staging run produced.
pub(crate) struct StagedOutcome {
    pub resources: Vec<bluelink_core::events::ResourceChangesMessage>,
    pub links: Vec<bluelink_core::events::LinkChangesMessage>,
    pub children: Vec<bluelink_core::events::ChildChangesMessage>,
    pub changes: Option<bluelink_core::changes::BlueprintChanges>,
    pub error: Option<Error>,
}

/// Drain a change staging stream to completion.
pub(crate) async fn collect_staging(mut stream: crate::ChangeStagingStream) -> StagedOutcome {
    let mut resources = Vec::new();
    let mut links = Vec::new();
    let mut children = Vec::new();
    loop {
        tokio::select! {
            Some(message) = stream.resource_changes.recv() => resources.push(message),
            Some(message) = stream.link_changes.recv() => links.push(message),
            Some(message) = stream.child_changes.recv() => children.push(message),
            else => break,
        }
    }
    let changes = stream.complete.await.ok();
    let error = stream.errors.recv().await;
    StagedOutcome {
        resources,
        links,
        children,
        changes,
        error,
    }
}

/// A container over the in-memory state store with stub collaborators.
pub(crate) fn harness(
    blueprint: Blueprint,
    registry: StaticProviderRegistry,
    oracle: StubOracle,
    loader: StubLoader,
) -> (BlueprintContainer, Arc<MemoryStateContainer>) {
    let state = Arc::new(MemoryStateContainer::new());
    let services = ContainerServices::new(
        state.clone(),
        Arc::new(registry),
        Arc::new(StubResolver),
        Arc::new(StubChildResolver),
        Arc::new(loader),
        Arc::new(oracle),
    )
    .with_polling(fast_polling());
    (BlueprintContainer::new(services, blueprint), state)
}
