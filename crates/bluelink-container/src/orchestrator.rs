//! Deploy and destroy orchestration.
//!
//! The orchestrator owns a run end to end: it resolves instance identity,
//! prepares the execution plan, drives the remove phase in reverse
//! dependency order and the deploy phase in wave order, consumes worker
//! messages from the internal channels, and emits the caller-facing event
//! stream. Instance-level status is always persisted before the
//! corresponding event is forwarded.

use crate::channels::{worker_channels, DeployStream, OrchestratorChannels, WorkerChannels,
    CHANNEL_CAPACITY};
use crate::child::{self, ChildDestroyCtx, ChildWorkerCtx};
use crate::link::{self, LinkDestroyCtx, LinkWorkerCtx};
use crate::locks::ResourceLockGuard;
use crate::prepare::{prepare, NodeKind, PreparedPlan};
use crate::resource::{self, ResourceDestroyCtx, ResourceWorkerCtx};
use crate::run_state::{DeploymentState, ElementId, ElementKind, ElementLifecycle};
use crate::staging;
use crate::ContainerServices;
use bluelink_core::changes::{BlueprintChanges, LinkChanges, ResourceChanges};
use bluelink_core::clock::Clock;
use bluelink_core::events::{
    ChildDeployUpdateMessage, DeployEvent, DeploymentFinishedMessage, DeploymentUpdateMessage,
    LinkDeployUpdateMessage, PreRollbackStateMessage, ResourceDeployUpdateMessage,
    SkippedRollbackItem,
};
use bluelink_core::id::IdGenerator;
use bluelink_core::provider::ProviderRegistry;
use bluelink_core::resolve::{BlueprintParams, ResolveStage, SubstitutionResolver};
use bluelink_core::schema::Blueprint;
use bluelink_core::state::{
    parse_link_name, InstanceCompletionDurations, InstanceSnapshot, InstanceState,
};
use bluelink_core::status::{ElementOperation, InstanceStatus, PreciseResourceStatus};
use bluelink_core::store::{
    ChildrenContainer, ExportsContainer, InstanceStatusInfo, InstancesContainer, LinkStatusInfo,
    LinksContainer, MetadataContainer, ResourceStatusInfo, ResourcesContainer, StateContainer,
};
use bluelink_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input to [`crate::BlueprintContainer::deploy`].
#[derive(Debug, Clone, Default)]
pub struct DeployInput {
    pub instance_id: Option<String>,
    pub instance_name: Option<String>,
    /// The staged change set to apply.
    pub changes: BlueprintChanges,
    /// Automatically destroy what was created when a first deployment of a
    /// new instance fails.
    pub rollback_on_failure: bool,
    /// Proceed even when the instance reports an operation in progress.
    pub force: bool,
    /// How long to keep accepting events from in-flight workers after
    /// cancellation. Elements still running when the drain expires are
    /// marked interrupted.
    pub drain_timeout: Option<Duration>,
}

/// Input to [`crate::BlueprintContainer::destroy`].
#[derive(Debug, Clone, Default)]
pub struct DestroyInput {
    pub instance_id: Option<String>,
    pub instance_name: Option<String>,
    /// The staged destroy change set.
    pub changes: BlueprintChanges,
    /// Proceed even when the instance reports an operation in progress, and
    /// clean up persisted state even when individual removals fail.
    pub force: bool,
    pub drain_timeout: Option<Duration>,
}

pub(crate) async fn start_deploy(
    services: Arc<ContainerServices>,
    blueprint: Arc<Blueprint>,
    input: DeployInput,
    params: BlueprintParams,
    cancel: CancellationToken,
) -> Result<DeployStream> {
    let (instance_id, existing) =
        resolve_identity(&services, input.instance_id.as_deref(), input.instance_name.as_deref())
            .await?;
    if let Some(existing) = &existing {
        if existing.status.is_in_progress() && !input.force {
            return Err(Error::InstanceInProgress {
                id: instance_id,
                status: existing.status,
            });
        }
    }
    let instance_is_new = existing.is_none();
    if instance_is_new {
        services
            .state
            .instances()
            .save(InstanceState {
                instance_id: instance_id.clone(),
                instance_name: input.instance_name.clone(),
                status: InstanceStatus::Preparing,
                created_at: Some(services.clock.now()),
                ..Default::default()
            })
            .await?;
    }

    let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (errors_tx, errors_rx) = mpsc::channel(16);
    let run = Run {
        services,
        blueprint,
        instance_id,
        instance_is_new,
        params,
        cancel,
        drain_timeout: input.drain_timeout,
        events_tx,
        run_state: DeploymentState::new(),
        started: HashSet::new(),
        guards: Vec::new(),
    };
    let handle = tokio::spawn(run_deploy(run, input.changes, input.rollback_on_failure, errors_tx));
    Ok(DeployStream {
        events: events_rx,
        errors: errors_rx,
        handle,
    })
}

pub(crate) async fn start_destroy(
    services: Arc<ContainerServices>,
    blueprint: Arc<Blueprint>,
    input: DestroyInput,
    params: BlueprintParams,
    cancel: CancellationToken,
) -> Result<DeployStream> {
    let (instance_id, existing) =
        resolve_identity(&services, input.instance_id.as_deref(), input.instance_name.as_deref())
            .await?;
    let Some(existing) = existing else {
        return Err(Error::InstanceNotFound(instance_id));
    };
    if existing.status.is_in_progress() && !input.force {
        return Err(Error::InstanceInProgress {
            id: instance_id,
            status: existing.status,
        });
    }

    let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (errors_tx, errors_rx) = mpsc::channel(16);
    let run = Run {
        services,
        blueprint,
        instance_id,
        instance_is_new: false,
        params,
        cancel,
        drain_timeout: input.drain_timeout,
        events_tx,
        run_state: DeploymentState::new(),
        started: HashSet::new(),
        guards: Vec::new(),
    };
    let handle = tokio::spawn(run_destroy(run, input.changes, input.force, errors_tx));
    Ok(DeployStream {
        events: events_rx,
        errors: errors_rx,
        handle,
    })
}

async fn resolve_identity(
    services: &Arc<ContainerServices>,
    instance_id: Option<&str>,
    instance_name: Option<&str>,
) -> Result<(String, Option<InstanceState>)> {
    match (instance_id, instance_name) {
        (Some(id), _) => match services.state.instances().get(id).await {
            Ok(state) => Ok((id.to_string(), Some(state))),
            Err(Error::InstanceNotFound(_)) => Ok((id.to_string(), None)),
            Err(error) => Err(error),
        },
        (None, Some(name)) => {
            match services.state.instances().lookup_id_by_name(name).await? {
                Some(id) => {
                    let state = services.state.instances().get(&id).await?;
                    Ok((id, Some(state)))
                }
                None => Ok((services.id_generator.generate(), None)),
            }
        }
        (None, None) => Err(Error::MissingInstanceIdentifier),
    }
}

/// State owned by the orchestrator task for one run.
struct Run {
    services: Arc<ContainerServices>,
    blueprint: Arc<Blueprint>,
    instance_id: String,
    instance_is_new: bool,
    params: BlueprintParams,
    cancel: CancellationToken,
    drain_timeout: Option<Duration>,
    events_tx: mpsc::Sender<DeployEvent>,
    run_state: DeploymentState,
    started: HashSet<ElementId>,
    guards: Vec<ResourceLockGuard>,
}

/// Worker message or control event consumed by the event loop.
enum LoopEvent {
    Resource(ResourceDeployUpdateMessage),
    Link(LinkDeployUpdateMessage),
    Child(ChildDeployUpdateMessage),
    Forward(DeployEvent),
    Fatal(Error),
    Cancelled,
    DrainExpired,
}

async fn run_deploy(
    mut run: Run,
    changes: BlueprintChanges,
    rollback_on_failure: bool,
    errors_tx: mpsc::Sender<Error>,
) {
    if let Err(error) = run_deploy_inner(&mut run, changes, rollback_on_failure).await {
        warn!(instance_id = %run.instance_id, error = %error, "Deployment aborted");
        let _ = errors_tx.send(error).await;
    }
}

async fn run_destroy(
    mut run: Run,
    changes: BlueprintChanges,
    force: bool,
    errors_tx: mpsc::Sender<Error>,
) {
    if let Err(error) = run_destroy_inner(&mut run, changes, force).await {
        warn!(instance_id = %run.instance_id, error = %error, "Destroy aborted");
        let _ = errors_tx.send(error).await;
    }
}

async fn run_deploy_inner(
    run: &mut Run,
    changes: BlueprintChanges,
    rollback_on_failure: bool,
) -> Result<()> {
    let started = run.services.clock.monotonic();
    let in_progress_status = if run.instance_is_new {
        InstanceStatus::Deploying
    } else {
        InstanceStatus::Updating
    };
    let (success_status, failed_status) = if run.instance_is_new {
        (InstanceStatus::Deployed, InstanceStatus::DeployFailed)
    } else {
        (InstanceStatus::Updated, InstanceStatus::UpdateFailed)
    };

    run.persist_and_emit_status(InstanceStatus::Preparing).await?;

    let prepare_started = run.services.clock.monotonic();
    let plan = match prepare(
        &run.blueprint,
        ResolveStage::Deployment,
        run.services.resolver.as_ref(),
        run.services.link_oracle.as_ref(),
        run.services.providers.as_ref(),
        &run.params,
    )
    .await
    {
        Ok(plan) => plan,
        Err(error) => {
            run.finish(failed_status, vec![error.to_string()], true, Vec::new(), None)
                .await?;
            return Ok(());
        }
    };
    run.run_state.set_prepare_duration_ms(
        run.services
            .clock
            .monotonic()
            .duration_since(prepare_started)
            .as_secs_f64()
            * 1000.0,
    );
    info!(
        instance_id = %run.instance_id,
        groups = plan.groups.len(),
        "Prepared deployment plan"
    );

    run.persist_and_emit_status(in_progress_status).await?;

    let (worker, mut rx) = worker_channels();

    // Remove phase: everything the change set removes goes first, in
    // reverse dependency order.
    let removal = RemovalSchedule::build(run, &changes).await?;
    run.execute_removals(&worker, &mut rx, removal).await?;

    // Deploy phase.
    let mut deploy_phase = DeployPhase::build(run, &plan, &changes);
    run.execute_deploy_phase(&worker, &mut rx, &plan, &mut deploy_phase)
        .await?;

    let cancelled = run.cancel.is_cancelled() && !run.run_state.is_run_complete();
    let failed = run.run_state.has_failures() || cancelled;
    let mut failure_reasons = run.run_state.failure_reasons();
    if cancelled {
        failure_reasons.push("deployment was cancelled".to_string());
    }
    let durations = InstanceCompletionDurations {
        prepare_ms: run.run_state.prepare_duration_ms(),
        total_ms: Some(
            run.services
                .clock
                .monotonic()
                .duration_since(started)
                .as_secs_f64()
                * 1000.0,
        ),
    };

    if !failed {
        run.save_exports_and_metadata().await?;
        run.finish(success_status, Vec::new(), true, Vec::new(), Some(durations))
            .await?;
        return Ok(());
    }

    // Rollback runs against the cancellation token, so a cancelled run
    // reports failure directly instead of fighting its own workers.
    if rollback_on_failure && run.instance_is_new && !cancelled {
        return run.rollback_new_instance(failed_status, failure_reasons, durations).await;
    }

    // Rollback of a previously deployed instance would need its prior state
    // re-applied, which is not automatic; report what was left in place.
    let skipped = if rollback_on_failure {
        run.started
            .iter()
            .map(|id| SkippedRollbackItem {
                element: id.name.clone(),
                reason: "automatic rollback is only supported for newly created instances"
                    .to_string(),
            })
            .collect()
    } else {
        Vec::new()
    };
    run.finish(failed_status, failure_reasons, true, skipped, Some(durations))
        .await?;
    Ok(())
}

async fn run_destroy_inner(run: &mut Run, changes: BlueprintChanges, force: bool) -> Result<()> {
    let started = run.services.clock.monotonic();
    run.persist_and_emit_status(InstanceStatus::Destroying).await?;

    let (worker, mut rx) = worker_channels();
    let removal = RemovalSchedule::build(run, &changes).await?;
    run.execute_removals(&worker, &mut rx, removal).await?;

    let cancelled = run.cancel.is_cancelled() && !run.run_state.is_run_complete();
    let failed = run.run_state.has_failures() || cancelled;
    let mut failure_reasons = run.run_state.failure_reasons();
    if cancelled {
        failure_reasons.push("destroy was cancelled".to_string());
    }
    let durations = InstanceCompletionDurations {
        prepare_ms: None,
        total_ms: Some(
            run.services
                .clock
                .monotonic()
                .duration_since(started)
                .as_secs_f64()
                * 1000.0,
        ),
    };

    if failed && !force {
        run.finish(
            InstanceStatus::DestroyFailed,
            failure_reasons,
            true,
            Vec::new(),
            Some(durations),
        )
        .await?;
        return Ok(());
    }

    if failed {
        // Forced destroy: record the failures but clean the instance up
        // anyway so a stuck instance can always be removed.
        warn!(
            instance_id = %run.instance_id,
            reasons = ?failure_reasons,
            "Forced destroy cleaning up despite element failures"
        );
    }
    match run.services.state.instances().remove(&run.instance_id).await {
        Ok(_) | Err(Error::InstanceNotFound(_)) => {}
        Err(error) => return Err(error),
    }
    run.finish(
        InstanceStatus::Destroyed,
        if force { failure_reasons } else { Vec::new() },
        true,
        Vec::new(),
        Some(durations),
    )
    .await?;
    Ok(())
}

/// Removal work derived from the change set and persisted state, ordered so
/// dependents are removed before their dependencies: links first, then
/// resources in reverse dependency waves, then children.
struct RemovalSchedule {
    links: Vec<String>,
    resource_waves: Vec<Vec<String>>,
    children: Vec<String>,
}

impl RemovalSchedule {
    async fn build(run: &Run, changes: &BlueprintChanges) -> Result<Self> {
        let mut removed_resources: Vec<String> = changes.removed_resources.clone();
        for (name, resource_changes) in &changes.resource_changes {
            if resource_changes.must_recreate {
                removed_resources.push(name.clone());
            }
        }
        let mut children: Vec<String> = changes.removed_children.clone();
        children.extend(changes.recreate_children.iter().cloned());

        if removed_resources.is_empty() && changes.removed_links.is_empty() && children.is_empty()
        {
            return Ok(Self {
                links: Vec::new(),
                resource_waves: Vec::new(),
                children,
            });
        }

        let instance = match run.services.state.instances().get(&run.instance_id).await {
            Ok(instance) => instance,
            Err(Error::InstanceNotFound(_)) => InstanceState::default(),
            Err(error) => return Err(error),
        };

        let removal_set: HashSet<&String> = removed_resources.iter().collect();
        // Reverse waves: a resource may only be destroyed after everything
        // that depends on it (within the removal set) is gone.
        let mut dependents: HashMap<&String, Vec<&String>> = HashMap::new();
        for name in &removed_resources {
            if let Some(state) = instance.resources.get(name) {
                for dep in &state.depends_on_resources {
                    if let Some(dep_name) = removal_set.get(dep) {
                        dependents.entry(*dep_name).or_default().push(name);
                    }
                }
            }
        }
        fn wave_of<'a>(
            name: &'a String,
            dependents: &HashMap<&'a String, Vec<&'a String>>,
            waves: &mut HashMap<&'a String, usize>,
        ) -> usize {
            if let Some(wave) = waves.get(name) {
                return *wave;
            }
            // Guard against re-entry; persisted dependency graphs are acyclic.
            waves.insert(name, 0);
            let wave = dependents
                .get(name)
                .map(|deps| {
                    deps.iter()
                        .copied()
                        .map(|dependent| wave_of(dependent, dependents, waves) + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            waves.insert(name, wave);
            wave
        }
        let mut waves: HashMap<&String, usize> = HashMap::new();
        let mut max_wave = 0;
        for name in &removed_resources {
            max_wave = max_wave.max(wave_of(name, &dependents, &mut waves));
        }
        let mut resource_waves: Vec<Vec<String>> = vec![Vec::new(); max_wave + 1];
        for name in &removed_resources {
            resource_waves[waves[name]].push(name.clone());
        }
        for wave in &mut resource_waves {
            wave.sort();
        }

        Ok(Self {
            links: changes.removed_links.clone(),
            resource_waves,
            children,
        })
    }
}

/// Per-run deploy phase bookkeeping: which elements the change set deploys
/// and with which operation.
struct DeployPhase {
    resource_ops: HashMap<String, (ElementOperation, Option<ResourceChanges>)>,
    child_changes: HashMap<String, Option<BlueprintChanges>>,
    links: HashMap<String, (ElementOperation, Option<LinkChanges>)>,
}

impl DeployPhase {
    fn build(run: &mut Run, plan: &PreparedPlan, changes: &BlueprintChanges) -> Self {
        let mut resource_ops = HashMap::new();
        let mut child_changes = HashMap::new();
        let mut links = HashMap::new();

        for node in plan.groups.iter().flatten() {
            let id = node.element_id();
            match id.kind {
                ElementKind::Resource => {
                    if let Some(resource) = changes.new_resources.get(&node.name) {
                        resource_ops.insert(
                            node.name.clone(),
                            (ElementOperation::Create, Some(resource.clone())),
                        );
                    } else if let Some(resource) = changes.resource_changes.get(&node.name) {
                        let operation = if resource.must_recreate {
                            ElementOperation::Create
                        } else {
                            ElementOperation::Update
                        };
                        resource_ops
                            .insert(node.name.clone(), (operation, Some(resource.clone())));
                    }
                }
                _ => {
                    if let Some(child) = changes.new_children.get(&node.name) {
                        child_changes.insert(node.name.clone(), Some(child.clone()));
                    } else if let Some(child) = changes.child_changes.get(&node.name) {
                        child_changes.insert(node.name.clone(), Some(child.clone()));
                    } else if changes.recreate_children.iter().any(|name| name == &node.name) {
                        // Recreated children stage a fresh change set inside
                        // the child worker.
                        child_changes.insert(node.name.clone(), None);
                    }
                }
            }

            if resource_ops.contains_key(&node.name) || child_changes.contains_key(&node.name) {
                run.run_state.register(id);
            } else {
                run.run_state.mark_prefinished(id);
            }
        }

        for (name, link) in &changes.new_links {
            links.insert(name.clone(), (ElementOperation::Create, Some(link.clone())));
            run.run_state.register(ElementId::link(name.clone()));
        }
        for (name, link) in &changes.link_changes {
            links.insert(name.clone(), (ElementOperation::Update, Some(link.clone())));
            run.run_state.register(ElementId::link(name.clone()));
        }

        Self {
            resource_ops,
            child_changes,
            links,
        }
    }
}

impl Run {
    async fn persist_and_emit_status(&self, status: InstanceStatus) -> Result<()> {
        let now = self.services.clock.now();
        self.services
            .state
            .instances()
            .update_status(
                &self.instance_id,
                InstanceStatusInfo {
                    status,
                    last_status_update_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        let _ = self
            .events_tx
            .send(DeployEvent::DeploymentUpdate(DeploymentUpdateMessage {
                instance_id: self.instance_id.clone(),
                status,
                update_timestamp: now,
            }))
            .await;
        Ok(())
    }

    /// Persist the terminal status, release every resource lock held for
    /// the run and forward the finish event, in that order.
    async fn finish(
        &mut self,
        status: InstanceStatus,
        failure_reasons: Vec<String>,
        end_of_stream: bool,
        skipped_rollback_items: Vec<SkippedRollbackItem>,
        durations: Option<InstanceCompletionDurations>,
    ) -> Result<()> {
        let now = self.services.clock.now();
        let update = InstanceStatusInfo {
            status,
            last_status_update_at: Some(now),
            last_deployed_at: (!status.is_failure()).then_some(now),
            last_deploy_attempted_at: Some(now),
            durations: durations.clone(),
        };
        match self
            .services
            .state
            .instances()
            .update_status(&self.instance_id, update)
            .await
        {
            // The record is legitimately gone after a successful destroy.
            Ok(()) | Err(Error::InstanceNotFound(_)) => {}
            Err(error) => return Err(error),
        }
        self.guards.clear();
        let _ = self
            .events_tx
            .send(DeployEvent::Finish(DeploymentFinishedMessage {
                instance_id: self.instance_id.clone(),
                status,
                failure_reasons,
                finish_timestamp: now,
                durations,
                end_of_stream,
                skipped_rollback_items,
            }))
            .await;
        Ok(())
    }

    async fn save_exports_and_metadata(&self) -> Result<()> {
        let mut exports = HashMap::new();
        for (name, def) in &self.blueprint.exports {
            let resolved = self
                .services
                .resolver
                .resolve_export(ResolveStage::Deployment, name, def, &self.params)
                .await?;
            exports.insert(
                name.clone(),
                bluelink_core::state::ExportState {
                    export_type: def.export_type.clone(),
                    field: def.field.clone(),
                    value: resolved.value.unwrap_or(serde_json::Value::Null),
                    description: def.description.clone(),
                },
            );
        }
        self.services
            .state
            .exports()
            .save_all(&self.instance_id, exports)
            .await?;
        if !self.blueprint.metadata.is_null() {
            self.services
                .state
                .metadata()
                .save(&self.instance_id, self.blueprint.metadata.clone())
                .await?;
        }
        Ok(())
    }

    /// Receive one event from the internal channels, honouring drain state.
    async fn next_event(
        &self,
        rx: &mut OrchestratorChannels,
        draining: bool,
        drain_deadline: tokio::time::Instant,
    ) -> LoopEvent {
        let cancel = self.cancel.clone();
        // Biased so forwarded child events drain ahead of the terminal
        // child update that completes the run.
        tokio::select! {
            biased;
            Some(event) = rx.forward_rx.recv() => LoopEvent::Forward(event),
            Some(error) = rx.err_rx.recv() => LoopEvent::Fatal(error),
            Some(message) = rx.resource_rx.recv() => LoopEvent::Resource(message),
            Some(message) = rx.link_rx.recv() => LoopEvent::Link(message),
            Some(message) = rx.child_rx.recv() => LoopEvent::Child(message),
            _ = cancel.cancelled(), if !draining => LoopEvent::Cancelled,
            _ = tokio::time::sleep_until(drain_deadline), if draining => LoopEvent::DrainExpired,
        }
    }

    async fn on_resource_message(&mut self, message: ResourceDeployUpdateMessage) -> Vec<String> {
        let lifecycle = resource::lifecycle_for_message(&message);
        let id = ElementId::resource(message.resource_name.clone());
        if lifecycle.is_terminal() {
            self.run_state
                .record_terminal(&id, lifecycle, &message.failure_reasons);
        } else {
            self.run_state.transition(&id, lifecycle);
        }
        let _ = self
            .events_tx
            .send(DeployEvent::ResourceUpdate(message))
            .await;
        Vec::new()
    }

    /// Returns queued links that became startable after this message.
    async fn on_link_message(&mut self, message: LinkDeployUpdateMessage) -> Vec<String> {
        let lifecycle = link::lifecycle_for_message(&message);
        let id = ElementId::link(message.link_name.clone());
        let mut startable = Vec::new();
        if lifecycle.is_terminal() {
            self.run_state
                .record_terminal(&id, lifecycle, &message.failure_reasons);
            startable = self.run_state.release_link_endpoints(&message.link_name);
        } else {
            self.run_state.transition(&id, lifecycle);
        }
        let _ = self.events_tx.send(DeployEvent::LinkUpdate(message)).await;
        startable
    }

    async fn on_child_message(&mut self, message: ChildDeployUpdateMessage) -> Vec<String> {
        let id = ElementId::child(message.child_name.clone());
        if message.status.is_terminal() {
            let lifecycle = if message.status.is_failure() {
                ElementLifecycle::Failed
            } else {
                ElementLifecycle::Completed
            };
            self.run_state
                .record_terminal(&id, lifecycle, &message.failure_reasons);
        } else {
            self.run_state.transition(&id, ElementLifecycle::InProgress);
        }
        let _ = self.events_tx.send(DeployEvent::ChildUpdate(message)).await;
        Vec::new()
    }

    /// Mark everything still in flight as interrupted after the drain
    /// deadline expired. Workers that already emitted a terminal update are
    /// unaffected.
    async fn mark_in_flight_interrupted(&mut self) -> Result<()> {
        for id in self.run_state.in_flight() {
            match id.kind {
                ElementKind::Resource => {
                    let interrupted =
                        PreciseResourceStatus::interrupted(ElementOperation::Create);
                    let info = ResourceStatusInfo {
                        status: interrupted.coarse(),
                        precise_status: interrupted,
                        ..Default::default()
                    };
                    match self
                        .services
                        .state
                        .resources()
                        .update_status(&self.instance_id, &id.name, info)
                        .await
                    {
                        Ok(()) | Err(Error::ResourceNotFound(_)) => {}
                        Err(error) => return Err(error),
                    }
                }
                ElementKind::Link => {
                    let info = LinkStatusInfo {
                        status: bluelink_core::status::LinkStatus::CreateFailed,
                        precise_status:
                            bluelink_core::status::PreciseLinkStatus::ResourceAUpdateInterrupted,
                        ..Default::default()
                    };
                    match self
                        .services
                        .state
                        .links()
                        .update_status(&self.instance_id, &id.name, info)
                        .await
                    {
                        Ok(()) | Err(Error::LinkNotFound(_)) => {}
                        Err(error) => return Err(error),
                    }
                }
                ElementKind::Child => {}
            }
            self.run_state.record_terminal(
                &id,
                ElementLifecycle::Interrupted,
                &["operation interrupted by cancellation".to_string()],
            );
        }
        Ok(())
    }

    async fn execute_removals(
        &mut self,
        worker: &WorkerChannels,
        rx: &mut OrchestratorChannels,
        removal: RemovalSchedule,
    ) -> Result<()> {
        // Links are removed before the resources they touch.
        let mut link_ids = Vec::new();
        for link_name in &removal.links {
            let id = ElementId::link(link_name.clone());
            self.run_state.register(id.clone());
            link_ids.push(id);
        }
        for link_name in &removal.links {
            self.start_link_destroy(worker, link_name).await?;
        }
        self.wait_for(worker, rx, &link_ids).await?;

        for wave in &removal.resource_waves {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let mut wave_ids = Vec::new();
            for name in wave {
                let id = ElementId::resource(name.clone());
                self.run_state.register(id.clone());
                wave_ids.push(id);
                self.start_resource_destroy(worker, name).await?;
            }
            self.wait_for(worker, rx, &wave_ids).await?;
        }

        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let mut child_ids = Vec::new();
        for child_name in &removal.children {
            let id = ElementId::child(child_name.clone());
            self.run_state.register(id.clone());
            child_ids.push(id);
            self.start_child_destroy(worker, child_name).await?;
        }
        self.wait_for(worker, rx, &child_ids).await?;
        Ok(())
    }

    /// Event loop until every element in `wait_for` is terminal, honouring
    /// cancellation and the drain deadline.
    async fn wait_for(
        &mut self,
        worker: &WorkerChannels,
        rx: &mut OrchestratorChannels,
        wait_for: &[ElementId],
    ) -> Result<()> {
        let mut draining = false;
        let mut drain_deadline = far_future();
        loop {
            if wait_for
                .iter()
                .all(|id| self.run_state.lifecycle(id).is_some_and(|lc| lc.is_terminal()))
            {
                return Ok(());
            }
            match self.next_event(rx, draining, drain_deadline).await {
                LoopEvent::Resource(message) => {
                    self.on_resource_message(message).await;
                }
                LoopEvent::Link(message) => {
                    let startable = self.on_link_message(message).await;
                    for link_name in startable {
                        self.spawn_link_destroy(worker, &link_name).await?;
                    }
                }
                LoopEvent::Child(message) => {
                    self.on_child_message(message).await;
                }
                LoopEvent::Forward(event) => {
                    let _ = self.events_tx.send(event).await;
                }
                LoopEvent::Fatal(error) => return Err(error),
                LoopEvent::Cancelled => {
                    draining = true;
                    drain_deadline = match self.drain_timeout {
                        Some(timeout) => tokio::time::Instant::now() + timeout,
                        None => tokio::time::Instant::now(),
                    };
                }
                LoopEvent::DrainExpired => {
                    self.mark_in_flight_interrupted().await?;
                    return Ok(());
                }
            }
        }
    }

    async fn execute_deploy_phase(
        &mut self,
        worker: &WorkerChannels,
        rx: &mut OrchestratorChannels,
        plan: &PreparedPlan,
        phase: &mut DeployPhase,
    ) -> Result<()> {
        // Cancellation before the phase begins: nothing gets dispatched.
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.dispatch_ready(worker, plan, phase).await?;
        self.maybe_start_links(worker, plan, phase).await?;

        let mut draining = false;
        let mut drain_deadline = far_future();
        loop {
            if self.run_state.is_run_complete() {
                return Ok(());
            }
            match self.next_event(rx, draining, drain_deadline).await {
                LoopEvent::Resource(message) => {
                    self.on_resource_message(message).await;
                    if !draining {
                        self.dispatch_ready(worker, plan, phase).await?;
                        self.maybe_start_links(worker, plan, phase).await?;
                    }
                }
                LoopEvent::Link(message) => {
                    let startable = self.on_link_message(message).await;
                    if !draining {
                        for link_name in startable {
                            self.start_link_deploy_claimed(worker, plan, phase, &link_name)
                                .await?;
                        }
                        self.dispatch_ready(worker, plan, phase).await?;
                    }
                }
                LoopEvent::Child(message) => {
                    self.on_child_message(message).await;
                    if !draining {
                        self.dispatch_ready(worker, plan, phase).await?;
                    }
                }
                LoopEvent::Forward(event) => {
                    let _ = self.events_tx.send(event).await;
                }
                LoopEvent::Fatal(error) => return Err(error),
                LoopEvent::Cancelled => {
                    draining = true;
                    drain_deadline = match self.drain_timeout {
                        Some(timeout) => tokio::time::Instant::now() + timeout,
                        None => tokio::time::Instant::now(),
                    };
                }
                LoopEvent::DrainExpired => {
                    self.mark_in_flight_interrupted().await?;
                    return Ok(());
                }
            }
        }
    }

    /// Dispatch every registered element whose readiness predicate holds:
    /// each direct dependency is either completed, or config-complete and
    /// not required to be stable first. Elements whose dependencies failed
    /// are cascaded to failed without being started.
    async fn dispatch_ready(
        &mut self,
        worker: &WorkerChannels,
        plan: &PreparedPlan,
        phase: &DeployPhase,
    ) -> Result<()> {
        loop {
            let mut dispatched_any = false;
            for node in plan.groups.iter().flatten() {
                let id = node.element_id();
                if self.started.contains(&id) {
                    continue;
                }
                let deploys = match id.kind {
                    ElementKind::Resource => phase.resource_ops.contains_key(&node.name),
                    _ => phase.child_changes.contains_key(&node.name),
                };
                if !deploys {
                    continue;
                }

                let mut ready = true;
                let mut failed_dependency = None;
                for dep in &node.direct_dependencies {
                    match self.run_state.lifecycle(dep) {
                        Some(ElementLifecycle::Completed) => {}
                        Some(ElementLifecycle::ConfigComplete)
                            if !node.stabilised_dependencies.contains(&dep.name) => {}
                        Some(ElementLifecycle::Failed) | Some(ElementLifecycle::Interrupted) => {
                            failed_dependency = Some(dep.name.clone());
                            break;
                        }
                        _ => {
                            ready = false;
                            break;
                        }
                    }
                }

                if let Some(dependency) = failed_dependency {
                    let reason = format!("dependency {dependency} failed");
                    debug!(element = %node.name, %dependency, "Skipping element, dependency failed");
                    self.started.insert(id.clone());
                    self.run_state
                        .record_terminal(&id, ElementLifecycle::Failed, &[reason]);
                    dispatched_any = true;
                    continue;
                }
                if !ready {
                    continue;
                }

                self.started.insert(id.clone());
                self.run_state.transition(&id, ElementLifecycle::InProgress);
                dispatched_any = true;
                match &node.kind {
                    NodeKind::Resource { resource_type } => {
                        let (operation, changes) = phase.resource_ops[&node.name].clone();
                        let guard = self
                            .services
                            .locks
                            .acquire(&self.instance_id, &node.name)
                            .await;
                        self.guards.push(guard);
                        let ctx = ResourceWorkerCtx {
                            services: self.services.clone(),
                            instance_id: self.instance_id.clone(),
                            name: node.name.clone(),
                            resource_type: resource_type.clone(),
                            def: plan.expanded.blueprint.resources[&node.name].clone(),
                            template: plan.expanded.template_items.get(&node.name).cloned(),
                            group: node.group,
                            operation,
                            changes,
                            depends_on_resources: node
                                .direct_dependencies
                                .iter()
                                .filter(|dep| dep.kind == ElementKind::Resource)
                                .map(|dep| dep.name.clone())
                                .collect(),
                            depends_on_children: node
                                .direct_dependencies
                                .iter()
                                .filter(|dep| dep.kind == ElementKind::Child)
                                .map(|dep| dep.name.clone())
                                .collect(),
                            provider: plan.providers[&node.name].clone(),
                            params: self.params.clone(),
                            events: worker.resource_tx.clone(),
                            errors: worker.err_tx.clone(),
                            cancel: self.cancel.clone(),
                        };
                        tokio::spawn(resource::deploy_resource(ctx));
                    }
                    NodeKind::Child => {
                        let ctx = ChildWorkerCtx {
                            services: self.services.clone(),
                            parent_instance_id: self.instance_id.clone(),
                            child_name: node.name.clone(),
                            group: node.group,
                            include: plan.expanded.blueprint.includes[&node.name].clone(),
                            changes: phase.child_changes[&node.name].clone(),
                            params: self.params.clone(),
                            drain_timeout: self.drain_timeout,
                            events: worker.child_tx.clone(),
                            forward: worker.forward_tx.clone(),
                            errors: worker.err_tx.clone(),
                            cancel: self.cancel.clone(),
                        };
                        tokio::spawn(child::deploy_child(ctx));
                    }
                }
            }
            if !dispatched_any {
                return Ok(());
            }
        }
    }

    /// Start staged links whose endpoints are both at least config-complete.
    /// Links sharing an endpoint are serialised through the endpoint claim.
    async fn maybe_start_links(
        &mut self,
        worker: &WorkerChannels,
        plan: &PreparedPlan,
        phase: &DeployPhase,
    ) -> Result<()> {
        let staged: Vec<String> = phase.links.keys().cloned().collect();
        for link_name in staged {
            let id = ElementId::link(link_name.clone());
            if self.started.contains(&id) {
                continue;
            }
            let Some((resource_a, resource_b)) = parse_link_name(&link_name) else {
                self.started.insert(id.clone());
                self.run_state.record_terminal(
                    &id,
                    ElementLifecycle::Failed,
                    &[format!("malformed link name: {link_name}")],
                );
                continue;
            };
            let endpoint_states = [
                self.run_state.lifecycle(&ElementId::resource(resource_a)),
                self.run_state.lifecycle(&ElementId::resource(resource_b)),
            ];
            if endpoint_states.iter().any(|lifecycle| {
                matches!(
                    lifecycle,
                    Some(ElementLifecycle::Failed) | Some(ElementLifecycle::Interrupted)
                )
            }) {
                self.started.insert(id.clone());
                self.run_state.record_terminal(
                    &id,
                    ElementLifecycle::Failed,
                    &[format!("a linked resource failed for {link_name}")],
                );
                continue;
            }
            let both_ready = endpoint_states.iter().all(|lifecycle| {
                matches!(
                    lifecycle,
                    Some(ElementLifecycle::ConfigComplete) | Some(ElementLifecycle::Completed)
                )
            });
            if !both_ready {
                continue;
            }
            if self.run_state.try_claim_link_endpoints(&link_name) {
                self.start_link_deploy_claimed(worker, plan, phase, &link_name)
                    .await?;
            }
        }
        Ok(())
    }

    /// Spawn a link deploy worker for a link whose endpoints are already
    /// claimed.
    async fn start_link_deploy_claimed(
        &mut self,
        worker: &WorkerChannels,
        plan: &PreparedPlan,
        phase: &DeployPhase,
        link_name: &str,
    ) -> Result<()> {
        let id = ElementId::link(link_name.to_string());
        if self.started.contains(&id) {
            // A stale queued entry can resurface after its endpoints were
            // claimed on release; give them back.
            self.run_state.release_link_endpoints(link_name);
            return Ok(());
        }
        self.started.insert(id.clone());
        let Some((resource_a, resource_b)) = parse_link_name(link_name) else {
            self.run_state.record_terminal(
                &id,
                ElementLifecycle::Failed,
                &[format!("malformed link name: {link_name}")],
            );
            return Ok(());
        };
        let (operation, changes) = phase.links[link_name].clone();
        let type_a = plan
            .expanded
            .blueprint
            .resources
            .get(resource_a)
            .map(|def| def.resource_type.clone());
        let type_b = plan
            .expanded
            .blueprint
            .resources
            .get(resource_b)
            .map(|def| def.resource_type.clone());
        let provider = match (type_a, type_b) {
            (Some(type_a), Some(type_b)) => {
                self.services.providers.link_provider(&type_a, &type_b)
            }
            _ => None,
        };
        let Some(provider) = provider else {
            self.run_state.release_link_endpoints(link_name);
            self.run_state.record_terminal(
                &id,
                ElementLifecycle::Failed,
                &[Error::LinkImplementationNotFound(link_name.to_string()).to_string()],
            );
            return Ok(());
        };
        self.run_state.transition(&id, ElementLifecycle::InProgress);
        let ctx = LinkWorkerCtx {
            services: self.services.clone(),
            instance_id: self.instance_id.clone(),
            link_name: link_name.to_string(),
            resource_a: resource_a.to_string(),
            resource_b: resource_b.to_string(),
            operation,
            changes,
            provider,
            events: worker.link_tx.clone(),
            errors: worker.err_tx.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(link::deploy_link(ctx));
        Ok(())
    }

    async fn start_link_destroy(
        &mut self,
        worker: &WorkerChannels,
        link_name: &str,
    ) -> Result<()> {
        if self.run_state.try_claim_link_endpoints(link_name) {
            self.spawn_link_destroy(worker, link_name).await?;
        }
        Ok(())
    }

    async fn spawn_link_destroy(
        &mut self,
        worker: &WorkerChannels,
        link_name: &str,
    ) -> Result<()> {
        let id = ElementId::link(link_name.to_string());
        if self.started.contains(&id) {
            self.run_state.release_link_endpoints(link_name);
            return Ok(());
        }
        self.started.insert(id.clone());
        let link_state = match self
            .services
            .state
            .links()
            .get(&self.instance_id, link_name)
            .await
        {
            Ok(state) => state,
            Err(Error::LinkNotFound(_)) => {
                // Nothing persisted: treat as already removed.
                self.run_state.release_link_endpoints(link_name);
                self.run_state
                    .record_terminal(&id, ElementLifecycle::Completed, &[]);
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        let provider = self.link_provider_for_state(&link_state).await?;
        let Some(provider) = provider else {
            self.run_state.release_link_endpoints(link_name);
            self.run_state.record_terminal(
                &id,
                ElementLifecycle::Failed,
                &[Error::LinkImplementationNotFound(link_name.to_string()).to_string()],
            );
            return Ok(());
        };
        self.run_state.transition(&id, ElementLifecycle::InProgress);
        let ctx = LinkDestroyCtx {
            services: self.services.clone(),
            instance_id: self.instance_id.clone(),
            link_name: link_name.to_string(),
            provider,
            events: worker.link_tx.clone(),
            errors: worker.err_tx.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(link::destroy_link(ctx));
        Ok(())
    }

    async fn link_provider_for_state(
        &self,
        link_state: &bluelink_core::state::LinkState,
    ) -> Result<Option<Arc<dyn bluelink_core::provider::LinkProvider>>> {
        let Some((resource_a, resource_b)) = link_state.endpoints() else {
            return Ok(None);
        };
        let type_a = match self
            .services
            .state
            .resources()
            .get(&self.instance_id, resource_a)
            .await
        {
            Ok(state) => state.resource_type,
            Err(Error::ResourceNotFound(_)) => return Ok(None),
            Err(error) => return Err(error),
        };
        let type_b = match self
            .services
            .state
            .resources()
            .get(&self.instance_id, resource_b)
            .await
        {
            Ok(state) => state.resource_type,
            Err(Error::ResourceNotFound(_)) => return Ok(None),
            Err(error) => return Err(error),
        };
        Ok(self.services.providers.link_provider(&type_a, &type_b))
    }

    async fn start_resource_destroy(
        &mut self,
        worker: &WorkerChannels,
        name: &str,
    ) -> Result<()> {
        let id = ElementId::resource(name.to_string());
        if self.started.contains(&id) {
            return Ok(());
        }
        self.started.insert(id.clone());
        let state = match self
            .services
            .state
            .resources()
            .get(&self.instance_id, name)
            .await
        {
            Ok(state) => state,
            Err(Error::ResourceNotFound(_)) => {
                self.run_state
                    .record_terminal(&id, ElementLifecycle::Completed, &[]);
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        let Some(provider) = self.services.providers.resource_provider(&state.resource_type)
        else {
            self.run_state.record_terminal(
                &id,
                ElementLifecycle::Failed,
                &[Error::ProviderNotFound(state.resource_type.clone()).to_string()],
            );
            return Ok(());
        };
        let guard = self.services.locks.acquire(&self.instance_id, name).await;
        self.guards.push(guard);
        self.run_state.transition(&id, ElementLifecycle::InProgress);
        let ctx = ResourceDestroyCtx {
            services: self.services.clone(),
            instance_id: self.instance_id.clone(),
            name: name.to_string(),
            provider,
            events: worker.resource_tx.clone(),
            errors: worker.err_tx.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(resource::destroy_resource(ctx));
        Ok(())
    }

    async fn start_child_destroy(
        &mut self,
        worker: &WorkerChannels,
        child_name: &str,
    ) -> Result<()> {
        let id = ElementId::child(child_name.to_string());
        if self.started.contains(&id) {
            return Ok(());
        }
        self.started.insert(id.clone());
        self.run_state.transition(&id, ElementLifecycle::InProgress);
        let ctx = ChildDestroyCtx {
            services: self.services.clone(),
            parent_instance_id: self.instance_id.clone(),
            child_name: child_name.to_string(),
            params: self.params.clone(),
            drain_timeout: self.drain_timeout,
            events: worker.child_tx.clone(),
            forward: worker.forward_tx.clone(),
            errors: worker.err_tx.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(child::destroy_child(ctx));
        Ok(())
    }

    /// Auto-rollback after a failed first deployment: emit the failed finish
    /// with `end_of_stream = false`, snapshot the instance as the exclusive
    /// boundary between the failed phase and the rollback phase, then
    /// destroy everything that was persisted for the instance.
    async fn rollback_new_instance(
        &mut self,
        failed_status: InstanceStatus,
        failure_reasons: Vec<String>,
        durations: InstanceCompletionDurations,
    ) -> Result<()> {
        self.finish(
            failed_status,
            failure_reasons,
            false,
            Vec::new(),
            Some(durations.clone()),
        )
        .await?;

        let snapshot = build_snapshot(&self.services, &self.instance_id).await?;
        let _ = self
            .events_tx
            .send(DeployEvent::PreRollbackState(PreRollbackStateMessage {
                instance_id: self.instance_id.clone(),
                state: snapshot,
                snapshot_timestamp: self.services.clock.now(),
            }))
            .await;

        self.persist_and_emit_status(InstanceStatus::RollingBack).await?;

        // Fresh bookkeeping for the rollback phase.
        self.run_state = DeploymentState::new();
        self.started.clear();
        let rollback_changes =
            staging::derive_destroy_changes(&self.services, &self.instance_id).await?;
        let (worker, mut rx) = worker_channels();
        let removal = RemovalSchedule::build(self, &rollback_changes).await?;
        self.execute_removals(&worker, &mut rx, removal).await?;

        if self.run_state.has_failures() {
            self.finish(
                InstanceStatus::RollbackFailed,
                self.run_state.failure_reasons(),
                true,
                Vec::new(),
                None,
            )
            .await?;
            return Ok(());
        }
        match self.services.state.instances().remove(&self.instance_id).await {
            Ok(_) | Err(Error::InstanceNotFound(_)) => {}
            Err(error) => return Err(error),
        }
        self.finish(InstanceStatus::RolledBack, Vec::new(), true, Vec::new(), None)
            .await?;
        Ok(())
    }
}

/// Recursively snapshot an instance and its children.
#[async_recursion::async_recursion]
pub(crate) async fn build_snapshot(
    services: &Arc<ContainerServices>,
    instance_id: &str,
) -> Result<InstanceSnapshot> {
    let instance = services.state.instances().get(instance_id).await?;
    let mut children = HashMap::new();
    for (child_name, child_instance_id) in services.state.children().list(instance_id).await? {
        children.insert(
            child_name,
            build_snapshot(services, &child_instance_id).await?,
        );
    }
    Ok(InstanceSnapshot { instance, children })
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}
