//! Resource deployment and destruction workers.
//!
//! Each resource runs in its own task:
//! resolve -> provider deploy (with retries) -> config-complete ->
//! stability polling -> deployed. All resource-level persistence happens
//! here, before the corresponding message is emitted, so observers never see
//! a status that is not durably stored.

use crate::run_state::ElementLifecycle;
use crate::ContainerServices;
use bluelink_core::changes::ResourceChanges;
use bluelink_core::clock::Clock;
use bluelink_core::events::ResourceDeployUpdateMessage;
use bluelink_core::provider::{
    HasStabilisedInput, ResourceDeployInput, ResourceDestroyInput, ResourceProvider,
};
use bluelink_core::id::IdGenerator;
use bluelink_core::resolve::{BlueprintParams, ResolveStage, SubstitutionResolver,
    TemplateItemContext};
use bluelink_core::schema::ResourceDef;
use bluelink_core::state::{ResourceCompletionDurations, ResourceState};
use bluelink_core::status::{ElementOperation, PreciseResourceStatus};
use bluelink_core::store::{ResourceStatusInfo, ResourcesContainer, StateContainer};
use bluelink_core::values::inject_path;
use bluelink_core::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Failure reason recorded when a resource does not stabilise in time.
pub const STABILISE_TIMEOUT_REASON: &str =
    "Resource failed to stabilise within the configured timeout";

pub(crate) struct ResourceWorkerCtx {
    pub services: Arc<ContainerServices>,
    pub instance_id: String,
    pub name: String,
    pub resource_type: String,
    pub def: ResourceDef,
    pub template: Option<TemplateItemContext>,
    pub group: usize,
    pub operation: ElementOperation,
    pub changes: Option<ResourceChanges>,
    pub depends_on_resources: Vec<String>,
    pub depends_on_children: Vec<String>,
    pub provider: Arc<dyn ResourceProvider>,
    pub params: BlueprintParams,
    pub events: mpsc::Sender<ResourceDeployUpdateMessage>,
    pub errors: mpsc::Sender<Error>,
    pub cancel: CancellationToken,
}

impl ResourceWorkerCtx {
    fn message(
        &self,
        resource_id: &str,
        precise_status: PreciseResourceStatus,
        failure_reasons: Vec<String>,
        can_retry: bool,
        attempt: u32,
        durations: Option<ResourceCompletionDurations>,
    ) -> ResourceDeployUpdateMessage {
        ResourceDeployUpdateMessage {
            instance_id: self.instance_id.clone(),
            resource_id: resource_id.to_string(),
            resource_name: self.name.clone(),
            group: Some(self.group),
            status: precise_status.coarse(),
            precise_status,
            failure_reasons,
            can_retry,
            attempt,
            update_timestamp: self.services.clock.now(),
            durations,
        }
    }
}

fn ms_since(clock: &dyn Clock, from: Instant) -> f64 {
    clock.monotonic().duration_since(from).as_secs_f64() * 1000.0
}

/// Entry point for a resource deploy worker. State-store failures abort the
/// whole run via the error channel; provider failures surface as messages.
pub(crate) async fn deploy_resource(ctx: ResourceWorkerCtx) {
    if let Err(error) = deploy_inner(&ctx).await {
        let _ = ctx.errors.send(error).await;
    }
}

async fn deploy_inner(ctx: &ResourceWorkerCtx) -> Result<()> {
    let services = &ctx.services;
    let clock = services.clock.as_ref();
    let started = clock.monotonic();

    let current = match services
        .state
        .resources()
        .get(&ctx.instance_id, &ctx.name)
        .await
    {
        Ok(state) => Some(state),
        Err(Error::ResourceNotFound(_)) => None,
        Err(error) => return Err(error),
    };
    let resource_id = current
        .as_ref()
        .map(|state| state.resource_id.clone())
        .unwrap_or_else(|| services.id_generator.generate());

    // Resolve-on-deploy: everything must resolve now that dependency
    // outputs are available.
    let resolved = match services
        .resolver
        .resolve_resource(
            ResolveStage::Deployment,
            &ctx.name,
            &ctx.def,
            &ctx.params,
            ctx.template.as_ref(),
        )
        .await
    {
        Ok(resolved) if resolved.unresolved_paths.is_empty() => resolved,
        Ok(resolved) => {
            let reason = format!(
                "fields could not be resolved at deploy time: {}",
                resolved.unresolved_paths.join(", ")
            );
            return fail_before_deploy(ctx, &resource_id, current, reason).await;
        }
        Err(error) => {
            return fail_before_deploy(ctx, &resource_id, current, error.to_string()).await;
        }
    };

    let template_name = ctx
        .template
        .as_ref()
        .map(|template| template.template_name.clone());
    let mut resource_state = ResourceState {
        resource_id: resource_id.clone(),
        name: ctx.name.clone(),
        template_name,
        resource_type: ctx.resource_type.clone(),
        instance_id: ctx.instance_id.clone(),
        status: PreciseResourceStatus::in_progress(ctx.operation).coarse(),
        precise_status: PreciseResourceStatus::in_progress(ctx.operation),
        spec_data: resolved.spec.clone(),
        depends_on_resources: ctx.depends_on_resources.clone(),
        depends_on_children: ctx.depends_on_children.clone(),
        drifted: false,
        failure_reasons: Vec::new(),
        last_deployed_at: current.as_ref().and_then(|state| state.last_deployed_at),
        last_deploy_attempted_at: Some(services.clock.now()),
        durations: None,
    };
    services.state.resources().save(resource_state.clone()).await?;
    let _ = ctx
        .events
        .send(ctx.message(
            &resource_id,
            PreciseResourceStatus::in_progress(ctx.operation),
            Vec::new(),
            false,
            1,
            None,
        ))
        .await;

    // Deploy with retries per the provider's policy. Intermediate failures
    // are emitted but not persisted so the attempt history survives in one
    // durations record on the terminal update.
    let policy = ctx.provider.retry_policy();
    let mut attempt: u32 = 1;
    let mut attempt_durations_ms: Vec<f64> = Vec::new();
    let output = loop {
        let attempt_started = clock.monotonic();
        let input = ResourceDeployInput {
            instance_id: ctx.instance_id.clone(),
            resource_id: resource_id.clone(),
            resource_name: ctx.name.clone(),
            resource_type: ctx.resource_type.clone(),
            spec_data: resolved.spec.clone(),
            current_state: current.clone(),
            changes: ctx.changes.clone(),
        };
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return interrupt(ctx, &resource_id).await;
            }
            result = ctx.provider.deploy(input) => result,
        };
        attempt_durations_ms.push(ms_since(clock, attempt_started));

        match result {
            Ok(output) => break output,
            Err(error) if error.is_retryable() && policy.can_retry(attempt) => {
                debug!(
                    resource = %ctx.name,
                    attempt,
                    reason = %error.reason(),
                    "Retrying resource deploy after transient failure"
                );
                let _ = ctx
                    .events
                    .send(ctx.message(
                        &resource_id,
                        PreciseResourceStatus::failed(ctx.operation),
                        vec![error.reason()],
                        true,
                        attempt,
                        Some(ResourceCompletionDurations {
                            attempt_durations_ms: attempt_durations_ms.clone(),
                            ..Default::default()
                        }),
                    ))
                    .await;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        return interrupt(ctx, &resource_id).await;
                    }
                    _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
                }
                attempt += 1;
            }
            Err(error) => {
                let durations = ResourceCompletionDurations {
                    config_complete_ms: None,
                    total_ms: Some(ms_since(clock, started)),
                    attempt_durations_ms,
                };
                let failed = PreciseResourceStatus::failed(ctx.operation);
                if matches!(error, bluelink_core::provider::ProviderError::Fatal { .. }) {
                    // Unwrapped provider errors get no status update; the
                    // element still terminates for run accounting.
                    warn!(
                        resource = %ctx.name,
                        reason = %error.reason(),
                        "Provider returned an unwrapped error; providers must wrap \
                         failures as retryable or deploy errors"
                    );
                } else {
                    warn!(resource = %ctx.name, reason = %error.reason(), "Resource deploy failed");
                    services
                        .state
                        .resources()
                        .update_status(
                            &ctx.instance_id,
                            &ctx.name,
                            ResourceStatusInfo {
                                status: failed.coarse(),
                                precise_status: failed,
                                failure_reasons: Some(vec![error.reason()]),
                                durations: Some(durations.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                let _ = ctx
                    .events
                    .send(ctx.message(
                        &resource_id,
                        failed,
                        vec![error.reason()],
                        false,
                        attempt,
                        Some(durations),
                    ))
                    .await;
                return Ok(());
            }
        }
    };

    // Merge provider-computed values for the declared computed fields into
    // the resolved spec.
    let mut merged_spec = resolved.spec.clone();
    for field_path in ctx.provider.computed_fields() {
        if let Some(value) = output.computed_field_values.get(&field_path) {
            inject_path(&mut merged_spec, &field_path, value.clone());
        }
    }

    let config_complete = PreciseResourceStatus::config_complete(ctx.operation);
    let mut durations = ResourceCompletionDurations {
        config_complete_ms: Some(ms_since(clock, started)),
        total_ms: None,
        attempt_durations_ms,
    };
    resource_state.spec_data = merged_spec.clone();
    resource_state.status = config_complete.coarse();
    resource_state.precise_status = config_complete;
    resource_state.durations = Some(durations.clone());
    services.state.resources().save(resource_state.clone()).await?;
    let _ = ctx
        .events
        .send(ctx.message(
            &resource_id,
            config_complete,
            Vec::new(),
            false,
            attempt,
            Some(durations.clone()),
        ))
        .await;

    // Poll for external stability until the configured timeout.
    let polling = services.polling;
    let deadline = tokio::time::Instant::now() + polling.timeout;
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return interrupt(ctx, &resource_id).await;
            }
            _ = tokio::time::sleep_until(deadline) => {
                durations.total_ms = Some(ms_since(clock, started));
                let failed = PreciseResourceStatus::failed(ctx.operation);
                services
                    .state
                    .resources()
                    .update_status(
                        &ctx.instance_id,
                        &ctx.name,
                        ResourceStatusInfo {
                            status: failed.coarse(),
                            precise_status: failed,
                            failure_reasons: Some(vec![STABILISE_TIMEOUT_REASON.to_string()]),
                            durations: Some(durations.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                let _ = ctx
                    .events
                    .send(ctx.message(
                        &resource_id,
                        failed,
                        vec![STABILISE_TIMEOUT_REASON.to_string()],
                        false,
                        attempt,
                        Some(durations),
                    ))
                    .await;
                return Ok(());
            }
            _ = tokio::time::sleep(polling.interval) => {}
        }

        let input = HasStabilisedInput {
            instance_id: ctx.instance_id.clone(),
            resource_id: resource_id.clone(),
            resource_name: ctx.name.clone(),
            resource_type: ctx.resource_type.clone(),
            spec_data: merged_spec.clone(),
        };
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return interrupt(ctx, &resource_id).await;
            }
            result = ctx.provider.has_stabilised(input) => result,
        };
        match result {
            Ok(output) if output.stabilised => {
                durations.total_ms = Some(ms_since(clock, started));
                let succeeded = PreciseResourceStatus::succeeded(ctx.operation);
                // Status-only update: the spec was persisted at
                // config-complete, and a link may have projected fields onto
                // it since.
                services
                    .state
                    .resources()
                    .update_status(
                        &ctx.instance_id,
                        &ctx.name,
                        ResourceStatusInfo {
                            status: succeeded.coarse(),
                            precise_status: succeeded,
                            durations: Some(durations.clone()),
                            last_deployed_at: Some(services.clock.now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                let _ = ctx
                    .events
                    .send(ctx.message(
                        &resource_id,
                        succeeded,
                        Vec::new(),
                        false,
                        attempt,
                        Some(durations),
                    ))
                    .await;
                return Ok(());
            }
            Ok(_) => {}
            Err(error) => {
                durations.total_ms = Some(ms_since(clock, started));
                let failed = PreciseResourceStatus::failed(ctx.operation);
                services
                    .state
                    .resources()
                    .update_status(
                        &ctx.instance_id,
                        &ctx.name,
                        ResourceStatusInfo {
                            status: failed.coarse(),
                            precise_status: failed,
                            failure_reasons: Some(vec![error.reason()]),
                            durations: Some(durations.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                let _ = ctx
                    .events
                    .send(ctx.message(
                        &resource_id,
                        failed,
                        vec![error.reason()],
                        false,
                        attempt,
                        Some(durations),
                    ))
                    .await;
                return Ok(());
            }
        }
    }
}

/// Persist a terminal failure for a resource that never reached the
/// provider, e.g. resolution failed.
async fn fail_before_deploy(
    ctx: &ResourceWorkerCtx,
    resource_id: &str,
    current: Option<ResourceState>,
    reason: String,
) -> Result<()> {
    let failed = PreciseResourceStatus::failed(ctx.operation);
    let mut state = current.unwrap_or_else(|| ResourceState {
        resource_id: resource_id.to_string(),
        name: ctx.name.clone(),
        resource_type: ctx.resource_type.clone(),
        instance_id: ctx.instance_id.clone(),
        ..Default::default()
    });
    state.status = failed.coarse();
    state.precise_status = failed;
    state.failure_reasons = vec![reason.clone()];
    state.last_deploy_attempted_at = Some(ctx.services.clock.now());
    ctx.services.state.resources().save(state).await?;
    let _ = ctx
        .events
        .send(ctx.message(resource_id, failed, vec![reason], false, 1, None))
        .await;
    Ok(())
}

/// Persist and emit an interrupted status after cancellation.
async fn interrupt(ctx: &ResourceWorkerCtx, resource_id: &str) -> Result<()> {
    let interrupted = PreciseResourceStatus::interrupted(ctx.operation);
    ctx.services
        .state
        .resources()
        .update_status(
            &ctx.instance_id,
            &ctx.name,
            ResourceStatusInfo {
                status: interrupted.coarse(),
                precise_status: interrupted,
                ..Default::default()
            },
        )
        .await?;
    let _ = ctx
        .events
        .send(ctx.message(resource_id, interrupted, Vec::new(), false, 0, None))
        .await;
    Ok(())
}

pub(crate) struct ResourceDestroyCtx {
    pub services: Arc<ContainerServices>,
    pub instance_id: String,
    pub name: String,
    pub provider: Arc<dyn ResourceProvider>,
    pub events: mpsc::Sender<ResourceDeployUpdateMessage>,
    pub errors: mpsc::Sender<Error>,
    pub cancel: CancellationToken,
}

/// Entry point for a resource destroy worker.
pub(crate) async fn destroy_resource(ctx: ResourceDestroyCtx) {
    if let Err(error) = destroy_inner(&ctx).await {
        let _ = ctx.errors.send(error).await;
    }
}

async fn destroy_inner(ctx: &ResourceDestroyCtx) -> Result<()> {
    let services = &ctx.services;
    let clock = services.clock.as_ref();
    let started = clock.monotonic();

    let current = services
        .state
        .resources()
        .get(&ctx.instance_id, &ctx.name)
        .await?;
    let resource_id = current.resource_id.clone();

    let message = |precise: PreciseResourceStatus,
                   reasons: Vec<String>,
                   can_retry: bool,
                   attempt: u32,
                   durations: Option<ResourceCompletionDurations>| {
        ResourceDeployUpdateMessage {
            instance_id: ctx.instance_id.clone(),
            resource_id: resource_id.clone(),
            resource_name: ctx.name.clone(),
            group: None,
            status: precise.coarse(),
            precise_status: precise,
            failure_reasons: reasons,
            can_retry,
            attempt,
            update_timestamp: services.clock.now(),
            durations,
        }
    };

    services
        .state
        .resources()
        .update_status(
            &ctx.instance_id,
            &ctx.name,
            ResourceStatusInfo {
                status: PreciseResourceStatus::Destroying.coarse(),
                precise_status: PreciseResourceStatus::Destroying,
                ..Default::default()
            },
        )
        .await?;
    let _ = ctx
        .events
        .send(message(PreciseResourceStatus::Destroying, Vec::new(), false, 1, None))
        .await;

    let policy = ctx.provider.retry_policy();
    let mut attempt: u32 = 1;
    let mut attempt_durations_ms: Vec<f64> = Vec::new();
    loop {
        let attempt_started = clock.monotonic();
        let input = ResourceDestroyInput {
            instance_id: ctx.instance_id.clone(),
            resource_state: current.clone(),
        };
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let interrupted = PreciseResourceStatus::DestroyInterrupted;
                services
                    .state
                    .resources()
                    .update_status(
                        &ctx.instance_id,
                        &ctx.name,
                        ResourceStatusInfo {
                            status: interrupted.coarse(),
                            precise_status: interrupted,
                            ..Default::default()
                        },
                    )
                    .await?;
                let _ = ctx
                    .events
                    .send(message(interrupted, Vec::new(), false, attempt, None))
                    .await;
                return Ok(());
            }
            result = ctx.provider.destroy(input) => result,
        };
        attempt_durations_ms.push(ms_since(clock, attempt_started));

        match result {
            Ok(()) => {
                services
                    .state
                    .resources()
                    .remove(&ctx.instance_id, &ctx.name)
                    .await?;
                let durations = ResourceCompletionDurations {
                    config_complete_ms: None,
                    total_ms: Some(ms_since(clock, started)),
                    attempt_durations_ms,
                };
                let _ = ctx
                    .events
                    .send(message(
                        PreciseResourceStatus::Destroyed,
                        Vec::new(),
                        false,
                        attempt,
                        Some(durations),
                    ))
                    .await;
                return Ok(());
            }
            Err(error) if error.is_retryable() && policy.can_retry(attempt) => {
                let _ = ctx
                    .events
                    .send(message(
                        PreciseResourceStatus::DestroyFailed,
                        vec![error.reason()],
                        true,
                        attempt,
                        None,
                    ))
                    .await;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        let interrupted = PreciseResourceStatus::DestroyInterrupted;
                        services
                            .state
                            .resources()
                            .update_status(
                                &ctx.instance_id,
                                &ctx.name,
                                ResourceStatusInfo {
                                    status: interrupted.coarse(),
                                    precise_status: interrupted,
                                    ..Default::default()
                                },
                            )
                            .await?;
                        let _ = ctx
                            .events
                            .send(message(interrupted, Vec::new(), false, attempt, None))
                            .await;
                        return Ok(());
                    }
                    _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
                }
                attempt += 1;
            }
            Err(error) => {
                let failed = PreciseResourceStatus::DestroyFailed;
                let durations = ResourceCompletionDurations {
                    config_complete_ms: None,
                    total_ms: Some(ms_since(clock, started)),
                    attempt_durations_ms,
                };
                services
                    .state
                    .resources()
                    .update_status(
                        &ctx.instance_id,
                        &ctx.name,
                        ResourceStatusInfo {
                            status: failed.coarse(),
                            precise_status: failed,
                            failure_reasons: Some(vec![error.reason()]),
                            durations: Some(durations.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                let _ = ctx
                    .events
                    .send(message(failed, vec![error.reason()], false, attempt, Some(durations)))
                    .await;
                return Ok(());
            }
        }
    }
}

/// Lifecycle transition a resource message maps onto for run bookkeeping.
pub(crate) fn lifecycle_for_message(message: &ResourceDeployUpdateMessage) -> ElementLifecycle {
    if message.can_retry {
        return ElementLifecycle::InProgress;
    }
    if message.precise_status.is_interrupted() {
        return ElementLifecycle::Interrupted;
    }
    if message.precise_status.is_failure() {
        return ElementLifecycle::Failed;
    }
    if message.precise_status.is_config_complete() {
        return ElementLifecycle::ConfigComplete;
    }
    match message.precise_status {
        PreciseResourceStatus::Created
        | PreciseResourceStatus::Updated
        | PreciseResourceStatus::Destroyed => ElementLifecycle::Completed,
        _ => ElementLifecycle::InProgress,
    }
}
