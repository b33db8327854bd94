//! Link deployment and destruction workers.
//!
//! A link runs three ordered stages: update resource A, update resource B,
//! update intermediary resources. Destroys run the destroy analogues in
//! reverse. Each stage keeps its own attempt counter and duration bucket.
//! The orchestrator only dispatches a link once both endpoints are
//! config-complete and neither endpoint is being mutated by another link.

use crate::run_state::ElementLifecycle;
use crate::ContainerServices;
use bluelink_core::changes::LinkChanges;
use bluelink_core::clock::Clock;
use bluelink_core::events::LinkDeployUpdateMessage;
use bluelink_core::id::IdGenerator;
use bluelink_core::provider::{
    LinkDestroyInput, LinkProvider, LinkUpdateIntermediariesInput, LinkUpdateResourceInput,
    ProviderError, ProviderResult,
};
use bluelink_core::state::{
    parse_resource_data_mapping_key, LinkCompletionDurations, LinkState, ResourceState,
};
use bluelink_core::status::{ElementOperation, LinkStatus, PreciseLinkStatus};
use bluelink_core::store::{LinkStatusInfo, LinksContainer, ResourcesContainer, StateContainer};
use bluelink_core::values::{extract_path, inject_path, merge_documents};
use bluelink_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The three ordered stages of a link update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStage {
    ResourceA,
    ResourceB,
    Intermediaries,
}

impl LinkStage {
    fn in_progress(&self) -> PreciseLinkStatus {
        match self {
            LinkStage::ResourceA => PreciseLinkStatus::UpdatingResourceA,
            LinkStage::ResourceB => PreciseLinkStatus::UpdatingResourceB,
            LinkStage::Intermediaries => PreciseLinkStatus::UpdatingIntermediaryResources,
        }
    }

    fn done(&self) -> PreciseLinkStatus {
        match self {
            LinkStage::ResourceA => PreciseLinkStatus::ResourceAUpdated,
            LinkStage::ResourceB => PreciseLinkStatus::ResourceBUpdated,
            LinkStage::Intermediaries => PreciseLinkStatus::IntermediaryResourcesUpdated,
        }
    }

    fn failed(&self) -> PreciseLinkStatus {
        match self {
            LinkStage::ResourceA => PreciseLinkStatus::ResourceAUpdateFailed,
            LinkStage::ResourceB => PreciseLinkStatus::ResourceBUpdateFailed,
            LinkStage::Intermediaries => PreciseLinkStatus::IntermediaryResourceUpdateFailed,
        }
    }

    fn interrupted(&self) -> PreciseLinkStatus {
        match self {
            LinkStage::ResourceA => PreciseLinkStatus::ResourceAUpdateInterrupted,
            LinkStage::ResourceB => PreciseLinkStatus::ResourceBUpdateInterrupted,
            LinkStage::Intermediaries => {
                PreciseLinkStatus::IntermediaryResourceUpdateInterrupted
            }
        }
    }

    fn index(&self) -> usize {
        match self {
            LinkStage::ResourceA => 0,
            LinkStage::ResourceB => 1,
            LinkStage::Intermediaries => 2,
        }
    }
}

pub(crate) struct LinkWorkerCtx {
    pub services: Arc<ContainerServices>,
    pub instance_id: String,
    pub link_name: String,
    pub resource_a: String,
    pub resource_b: String,
    pub operation: ElementOperation,
    pub changes: Option<LinkChanges>,
    pub provider: Arc<dyn LinkProvider>,
    pub events: mpsc::Sender<LinkDeployUpdateMessage>,
    pub errors: mpsc::Sender<Error>,
    pub cancel: CancellationToken,
}

struct LinkRun<'a> {
    ctx: &'a LinkWorkerCtx,
    link_id: String,
    in_progress_status: LinkStatus,
    failed_status: LinkStatus,
    started: Instant,
    durations: LinkCompletionDurations,
}

enum StageOutcome<T> {
    Done(T),
    /// The stage failed terminally or was interrupted; the worker already
    /// persisted and emitted the terminal update.
    Abort,
}

impl<'a> LinkRun<'a> {
    fn message(
        &self,
        precise_status: PreciseLinkStatus,
        status: LinkStatus,
        failure_reasons: Vec<String>,
        can_retry: bool,
        attempt: u32,
        durations: Option<LinkCompletionDurations>,
    ) -> LinkDeployUpdateMessage {
        LinkDeployUpdateMessage {
            instance_id: self.ctx.instance_id.clone(),
            link_id: self.link_id.clone(),
            link_name: self.ctx.link_name.clone(),
            status,
            precise_status,
            failure_reasons,
            can_retry,
            attempt,
            update_timestamp: self.ctx.services.clock.now(),
            durations,
        }
    }

    /// Run one stage with retries. Terminal failures and interruptions are
    /// persisted and emitted here.
    async fn run_stage<T, F, Fut>(&mut self, stage: LinkStage, call: F) -> Result<StageOutcome<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let ctx = self.ctx;
        let clock = ctx.services.clock.as_ref();
        let stage_started = clock.monotonic();
        let policy = ctx.provider.retry_policy();
        let mut attempt: u32 = 1;

        let _ = ctx
            .events
            .send(self.message(
                stage.in_progress(),
                self.in_progress_status,
                Vec::new(),
                false,
                attempt,
                None,
            ))
            .await;

        loop {
            let attempt_started = clock.monotonic();
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    self.interrupt(stage).await?;
                    return Ok(StageOutcome::Abort);
                }
                result = call() => result,
            };
            self.durations.attempt_durations_ms[stage.index()]
                .push(ms_since(clock, attempt_started));

            match result {
                Ok(output) => {
                    let stage_ms = ms_since(clock, stage_started);
                    match stage {
                        LinkStage::ResourceA => {
                            self.durations.resource_a_update_ms = Some(stage_ms);
                        }
                        LinkStage::ResourceB => {
                            self.durations.resource_b_update_ms = Some(stage_ms);
                        }
                        LinkStage::Intermediaries => {
                            self.durations.intermediary_resources_update_ms = Some(stage_ms);
                        }
                    }
                    return Ok(StageOutcome::Done(output));
                }
                Err(error) if error.is_retryable() && policy.can_retry(attempt) => {
                    debug!(
                        link = %ctx.link_name,
                        stage = ?stage,
                        attempt,
                        reason = %error.reason(),
                        "Retrying link stage after transient failure"
                    );
                    let _ = ctx
                        .events
                        .send(self.message(
                            stage.failed(),
                            self.in_progress_status,
                            vec![error.reason()],
                            true,
                            attempt,
                            Some(self.durations.clone()),
                        ))
                        .await;
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            self.interrupt(stage).await?;
                            return Ok(StageOutcome::Abort);
                        }
                        _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
                    }
                    attempt += 1;
                }
                Err(error) => {
                    warn!(
                        link = %ctx.link_name,
                        stage = ?stage,
                        reason = %error.reason(),
                        "Link stage failed"
                    );
                    self.fail(stage, error, attempt).await?;
                    return Ok(StageOutcome::Abort);
                }
            }
        }
    }

    async fn fail(&mut self, stage: LinkStage, error: ProviderError, attempt: u32) -> Result<()> {
        let clock = self.ctx.services.clock.as_ref();
        self.durations.total_ms = Some(ms_since(clock, self.started));
        if matches!(error, ProviderError::Fatal { .. }) {
            // Unwrapped provider errors get no status update.
            warn!(
                link = %self.ctx.link_name,
                reason = %error.reason(),
                "Link provider returned an unwrapped error; providers must wrap \
                 failures as retryable or deploy errors"
            );
            let _ = self
                .ctx
                .events
                .send(self.message(
                    stage.failed(),
                    self.failed_status,
                    vec![error.reason()],
                    false,
                    attempt,
                    Some(self.durations.clone()),
                ))
                .await;
            return Ok(());
        }
        self.ctx
            .services
            .state
            .links()
            .update_status(
                &self.ctx.instance_id,
                &self.ctx.link_name,
                LinkStatusInfo {
                    status: self.failed_status,
                    precise_status: stage.failed(),
                    failure_reasons: Some(vec![error.reason()]),
                    durations: Some(self.durations.clone()),
                    ..Default::default()
                },
            )
            .await?;
        let _ = self
            .ctx
            .events
            .send(self.message(
                stage.failed(),
                self.failed_status,
                vec![error.reason()],
                false,
                attempt,
                Some(self.durations.clone()),
            ))
            .await;
        Ok(())
    }

    async fn interrupt(&self, stage: LinkStage) -> Result<()> {
        self.ctx
            .services
            .state
            .links()
            .update_status(
                &self.ctx.instance_id,
                &self.ctx.link_name,
                LinkStatusInfo {
                    status: self.failed_status,
                    precise_status: stage.interrupted(),
                    ..Default::default()
                },
            )
            .await?;
        let _ = self
            .ctx
            .events
            .send(self.message(
                stage.interrupted(),
                self.failed_status,
                Vec::new(),
                false,
                0,
                None,
            ))
            .await;
        Ok(())
    }
}

fn ms_since(clock: &dyn Clock, from: Instant) -> f64 {
    clock.monotonic().duration_since(from).as_secs_f64() * 1000.0
}

/// Entry point for a link deploy worker.
pub(crate) async fn deploy_link(ctx: LinkWorkerCtx) {
    if let Err(error) = deploy_inner(&ctx).await {
        let _ = ctx.errors.send(error).await;
    }
}

async fn deploy_inner(ctx: &LinkWorkerCtx) -> Result<()> {
    let services = &ctx.services;
    let clock = services.clock.as_ref();

    let current = match services
        .state
        .links()
        .get(&ctx.instance_id, &ctx.link_name)
        .await
    {
        Ok(state) => Some(state),
        Err(Error::LinkNotFound(_)) => None,
        Err(error) => return Err(error),
    };
    let link_id = current
        .as_ref()
        .map(|state| state.link_id.clone())
        .unwrap_or_else(|| services.id_generator.generate());

    let (in_progress_status, failed_status, succeeded_status) = match ctx.operation {
        ElementOperation::Create => {
            (LinkStatus::Creating, LinkStatus::CreateFailed, LinkStatus::Created)
        }
        _ => (LinkStatus::Updating, LinkStatus::UpdateFailed, LinkStatus::Updated),
    };

    let mut link_state = current.clone().unwrap_or_else(|| LinkState {
        link_id: link_id.clone(),
        name: ctx.link_name.clone(),
        instance_id: ctx.instance_id.clone(),
        ..Default::default()
    });
    link_state.status = in_progress_status;
    link_state.precise_status = PreciseLinkStatus::UpdatingResourceA;
    link_state.failure_reasons = Vec::new();
    link_state.last_deploy_attempted_at = Some(services.clock.now());
    services.state.links().save(link_state.clone()).await?;

    let mut run = LinkRun {
        ctx,
        link_id: link_id.clone(),
        in_progress_status,
        failed_status,
        started: clock.monotonic(),
        durations: LinkCompletionDurations::default(),
    };

    let resource_a = services
        .state
        .resources()
        .get(&ctx.instance_id, &ctx.resource_a)
        .await?;
    let resource_b = services
        .state
        .resources()
        .get(&ctx.instance_id, &ctx.resource_b)
        .await?;

    // Stage 1: update resource A.
    let stage_input = LinkUpdateResourceInput {
        instance_id: ctx.instance_id.clone(),
        link_id: link_id.clone(),
        link_name: ctx.link_name.clone(),
        resource: resource_a.clone(),
        other_resource: resource_b.clone(),
        link_data: link_state.data.clone(),
        changes: ctx.changes.clone(),
    };
    let provider = ctx.provider.clone();
    let output = match run
        .run_stage(LinkStage::ResourceA, || {
            let input = stage_input.clone();
            let provider = provider.clone();
            async move { provider.update_resource_a(input).await }
        })
        .await?
    {
        StageOutcome::Done(output) => output,
        StageOutcome::Abort => return Ok(()),
    };
    merge_documents(&mut link_state.data, output.link_data);
    link_state
        .resource_data_mappings
        .extend(output.resource_data_mappings);
    link_state.precise_status = PreciseLinkStatus::ResourceAUpdated;
    services.state.links().save(link_state.clone()).await?;
    project_mapped_fields(services, &link_state, &ctx.resource_a).await?;
    let _ = ctx
        .events
        .send(run.message(
            PreciseLinkStatus::ResourceAUpdated,
            in_progress_status,
            Vec::new(),
            false,
            0,
            Some(run.durations.clone()),
        ))
        .await;

    // Stage 2: update resource B.
    let stage_input = LinkUpdateResourceInput {
        instance_id: ctx.instance_id.clone(),
        link_id: link_id.clone(),
        link_name: ctx.link_name.clone(),
        resource: resource_b.clone(),
        other_resource: resource_a.clone(),
        link_data: link_state.data.clone(),
        changes: ctx.changes.clone(),
    };
    let output = match run
        .run_stage(LinkStage::ResourceB, || {
            let input = stage_input.clone();
            let provider = provider.clone();
            async move { provider.update_resource_b(input).await }
        })
        .await?
    {
        StageOutcome::Done(output) => output,
        StageOutcome::Abort => return Ok(()),
    };
    merge_documents(&mut link_state.data, output.link_data);
    link_state
        .resource_data_mappings
        .extend(output.resource_data_mappings);
    link_state.precise_status = PreciseLinkStatus::ResourceBUpdated;
    services.state.links().save(link_state.clone()).await?;
    project_mapped_fields(services, &link_state, &ctx.resource_b).await?;
    let _ = ctx
        .events
        .send(run.message(
            PreciseLinkStatus::ResourceBUpdated,
            in_progress_status,
            Vec::new(),
            false,
            0,
            Some(run.durations.clone()),
        ))
        .await;

    // Stage 3: update intermediary resources owned by the link.
    let stage_input = LinkUpdateIntermediariesInput {
        instance_id: ctx.instance_id.clone(),
        link_id: link_id.clone(),
        link_name: ctx.link_name.clone(),
        resource_a: resource_a.clone(),
        resource_b: resource_b.clone(),
        link_data: link_state.data.clone(),
        current_intermediaries: link_state.intermediary_resource_states.clone(),
    };
    let output = match run
        .run_stage(LinkStage::Intermediaries, || {
            let input = stage_input.clone();
            let provider = provider.clone();
            async move { provider.update_intermediary_resources(input).await }
        })
        .await?
    {
        StageOutcome::Done(output) => output,
        StageOutcome::Abort => return Ok(()),
    };
    merge_documents(&mut link_state.data, output.link_data);
    link_state.intermediary_resource_states = output.intermediary_resource_states;

    run.durations.total_ms = Some(ms_since(clock, run.started));
    link_state.status = succeeded_status;
    link_state.precise_status = PreciseLinkStatus::Complete;
    link_state.durations = Some(run.durations.clone());
    link_state.last_deployed_at = Some(services.clock.now());
    services.state.links().save(link_state).await?;
    let _ = ctx
        .events
        .send(run.message(
            PreciseLinkStatus::Complete,
            succeeded_status,
            Vec::new(),
            false,
            0,
            Some(run.durations.clone()),
        ))
        .await;
    Ok(())
}

/// Reflect link-written resource fields onto the endpoint's persisted spec
/// using the link's resource data mappings. The same mechanism keeps link
/// data and resource specs consistent during reconciliation.
async fn project_mapped_fields(
    services: &Arc<ContainerServices>,
    link_state: &LinkState,
    resource_name: &str,
) -> Result<()> {
    let mut resource: Option<ResourceState> = None;
    for (mapping_key, data_path) in &link_state.resource_data_mappings {
        let Some((mapped_resource, field_path)) = parse_resource_data_mapping_key(mapping_key)
        else {
            continue;
        };
        if mapped_resource != resource_name {
            continue;
        }
        let Some(value) = extract_path(&link_state.data, data_path) else {
            continue;
        };
        if resource.is_none() {
            resource = Some(
                services
                    .state
                    .resources()
                    .get(&link_state.instance_id, resource_name)
                    .await?,
            );
        }
        if let Some(resource_state) = resource.as_mut() {
            inject_path(&mut resource_state.spec_data, field_path, value.clone());
        }
    }
    if let Some(resource_state) = resource {
        services.state.resources().save(resource_state).await?;
    }
    Ok(())
}

pub(crate) struct LinkDestroyCtx {
    pub services: Arc<ContainerServices>,
    pub instance_id: String,
    pub link_name: String,
    pub provider: Arc<dyn LinkProvider>,
    pub events: mpsc::Sender<LinkDeployUpdateMessage>,
    pub errors: mpsc::Sender<Error>,
    pub cancel: CancellationToken,
}

/// Entry point for a link destroy worker. Stages run in reverse:
/// intermediaries, then resource B, then resource A.
pub(crate) async fn destroy_link(ctx: LinkDestroyCtx) {
    if let Err(error) = destroy_inner(&ctx).await {
        let _ = ctx.errors.send(error).await;
    }
}

async fn destroy_inner(ctx: &LinkDestroyCtx) -> Result<()> {
    let services = &ctx.services;
    let clock = services.clock.as_ref();

    let link_state = services
        .state
        .links()
        .get(&ctx.instance_id, &ctx.link_name)
        .await?;
    let link_id = link_state.link_id.clone();
    let (resource_a_name, resource_b_name) = link_state
        .endpoints()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| Error::Internal(format!("malformed link name: {}", ctx.link_name)))?;

    let resource_a = match services
        .state
        .resources()
        .get(&ctx.instance_id, &resource_a_name)
        .await
    {
        Ok(state) => Some(state),
        Err(Error::ResourceNotFound(_)) => None,
        Err(error) => return Err(error),
    };
    let resource_b = match services
        .state
        .resources()
        .get(&ctx.instance_id, &resource_b_name)
        .await
    {
        Ok(state) => Some(state),
        Err(Error::ResourceNotFound(_)) => None,
        Err(error) => return Err(error),
    };

    let worker_ctx = LinkWorkerCtx {
        services: ctx.services.clone(),
        instance_id: ctx.instance_id.clone(),
        link_name: ctx.link_name.clone(),
        resource_a: resource_a_name,
        resource_b: resource_b_name,
        operation: ElementOperation::Destroy,
        changes: None,
        provider: ctx.provider.clone(),
        events: ctx.events.clone(),
        errors: ctx.errors.clone(),
        cancel: ctx.cancel.clone(),
    };
    let mut run = LinkRun {
        ctx: &worker_ctx,
        link_id: link_id.clone(),
        in_progress_status: LinkStatus::Destroying,
        failed_status: LinkStatus::DestroyFailed,
        started: clock.monotonic(),
        durations: LinkCompletionDurations::default(),
    };

    services
        .state
        .links()
        .update_status(
            &ctx.instance_id,
            &ctx.link_name,
            LinkStatusInfo {
                status: LinkStatus::Destroying,
                precise_status: PreciseLinkStatus::UpdatingIntermediaryResources,
                ..Default::default()
            },
        )
        .await?;

    let destroy_input = LinkDestroyInput {
        instance_id: ctx.instance_id.clone(),
        link_state: link_state.clone(),
        resource_a,
        resource_b,
    };

    let provider = ctx.provider.clone();
    let stages: [(LinkStage, StageCall); 3] = [
        (LinkStage::Intermediaries, StageCall::Intermediaries),
        (LinkStage::ResourceB, StageCall::ResourceB),
        (LinkStage::ResourceA, StageCall::ResourceA),
    ];
    for (stage, call) in stages {
        let input = destroy_input.clone();
        let provider = provider.clone();
        let outcome = run
            .run_stage(stage, move || {
                let input = input.clone();
                let provider = provider.clone();
                async move {
                    match call {
                        StageCall::Intermediaries => {
                            provider.destroy_intermediary_resources(input).await
                        }
                        StageCall::ResourceB => provider.destroy_resource_b(input).await,
                        StageCall::ResourceA => provider.destroy_resource_a(input).await,
                    }
                }
            })
            .await?;
        if matches!(outcome, StageOutcome::Abort) {
            return Ok(());
        }
    }

    run.durations.total_ms = Some(ms_since(clock, run.started));
    services
        .state
        .links()
        .remove(&ctx.instance_id, &ctx.link_name)
        .await?;
    let _ = ctx
        .events
        .send(LinkDeployUpdateMessage {
            instance_id: ctx.instance_id.clone(),
            link_id,
            link_name: ctx.link_name.clone(),
            status: LinkStatus::Destroyed,
            precise_status: PreciseLinkStatus::Complete,
            failure_reasons: Vec::new(),
            can_retry: false,
            attempt: 0,
            update_timestamp: services.clock.now(),
            durations: Some(run.durations.clone()),
        })
        .await;
    Ok(())
}

#[derive(Clone, Copy)]
enum StageCall {
    Intermediaries,
    ResourceB,
    ResourceA,
}

/// Lifecycle transition a link message maps onto for run bookkeeping.
pub(crate) fn lifecycle_for_message(message: &LinkDeployUpdateMessage) -> ElementLifecycle {
    if message.can_retry {
        return ElementLifecycle::InProgress;
    }
    if message.precise_status.is_interrupted() {
        return ElementLifecycle::Interrupted;
    }
    if message.precise_status.is_failure() {
        return ElementLifecycle::Failed;
    }
    if message.precise_status == PreciseLinkStatus::Complete {
        return ElementLifecycle::Completed;
    }
    ElementLifecycle::InProgress
}
