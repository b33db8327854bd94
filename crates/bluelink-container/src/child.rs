//! Child blueprint deployment and destruction workers.
//!
//! A child include is deployed as its own instance through a recursive
//! container run. The worker resolves and loads the child blueprint, builds
//! child parameters (include variables plus inherited context variables),
//! enforces nesting depth and include cycles, and forwards the child's
//! events upward: instance-level updates become `ChildDeployUpdateMessage`s,
//! resource and link events are forwarded verbatim with the child instance
//! id preserved.

use crate::config::MAX_BLUEPRINT_DEPTH;
use crate::orchestrator::{DeployInput, DestroyInput};
use crate::staging::{self, StageChangesInput};
use crate::{BlueprintContainer, ContainerServices};
use bluelink_core::changes::BlueprintChanges;
use bluelink_core::clock::Clock;
use bluelink_core::events::{ChildDeployUpdateMessage, DeployEvent};
use bluelink_core::id::IdGenerator;
use bluelink_core::resolve::{
    BlueprintLoader, BlueprintParams, ChildBlueprintInfo, ChildResolver, ResolveStage,
    SubstitutionResolver, CONTEXT_BLUEPRINT_DIR, CONTEXT_INCLUDE_TREE_PATH,
    CONTEXT_INSTANCE_TREE_PATH, CONTEXT_PARENT_INSTANCE_ID,
};
use bluelink_core::schema::{Blueprint, IncludeDef};
use bluelink_core::store::{ChildrenContainer, StateContainer};
use bluelink_core::status::InstanceStatus;
use bluelink_core::{Error, Result};
use async_recursion::async_recursion;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) struct ChildWorkerCtx {
    pub services: Arc<ContainerServices>,
    pub parent_instance_id: String,
    pub child_name: String,
    pub group: usize,
    pub include: IncludeDef,
    /// Staged changes for the child; `None` for recreated children, which
    /// stage a fresh change set here.
    pub changes: Option<BlueprintChanges>,
    pub params: BlueprintParams,
    pub drain_timeout: Option<Duration>,
    pub events: mpsc::Sender<ChildDeployUpdateMessage>,
    pub forward: mpsc::Sender<DeployEvent>,
    pub errors: mpsc::Sender<Error>,
    pub cancel: CancellationToken,
}

pub(crate) struct ChildDestroyCtx {
    pub services: Arc<ContainerServices>,
    pub parent_instance_id: String,
    pub child_name: String,
    pub params: BlueprintParams,
    pub drain_timeout: Option<Duration>,
    pub events: mpsc::Sender<ChildDeployUpdateMessage>,
    pub forward: mpsc::Sender<DeployEvent>,
    pub errors: mpsc::Sender<Error>,
    pub cancel: CancellationToken,
}

/// Entry point for a child deploy worker. Validation failures (cycles,
/// depth, resolution) fail the child element; state-store failures abort the
/// whole run.
pub(crate) async fn deploy_child(ctx: ChildWorkerCtx) {
    match deploy_inner(&ctx).await {
        Ok(()) => {}
        Err(error @ Error::StateStore(_)) => {
            let _ = ctx.errors.send(error).await;
        }
        Err(error) => {
            warn!(
                child = %ctx.child_name,
                error = %error,
                "Child blueprint deployment failed"
            );
            let _ = ctx
                .events
                .send(ChildDeployUpdateMessage {
                    parent_instance_id: ctx.parent_instance_id.clone(),
                    child_instance_id: String::new(),
                    child_name: ctx.child_name.clone(),
                    group: Some(ctx.group),
                    status: InstanceStatus::DeployFailed,
                    failure_reasons: vec![error.to_string()],
                    update_timestamp: ctx.services.clock.now(),
                })
                .await;
        }
    }
}

#[async_recursion]
async fn deploy_inner(ctx: &ChildWorkerCtx) -> Result<()> {
    // Depth first: the include tree path counts ancestors, this child is one
    // deeper.
    let include_tree_path = child_include_tree_path(&ctx.params, &ctx.child_name);
    if include_tree_path.split('/').count() > MAX_BLUEPRINT_DEPTH {
        return Err(Error::MaxBlueprintDepthExceeded {
            max: MAX_BLUEPRINT_DEPTH,
        });
    }

    let resolved_include = ctx
        .services
        .resolver
        .resolve_include(
            ResolveStage::Deployment,
            &ctx.child_name,
            &ctx.include,
            &ctx.params,
        )
        .await?;
    let info = ctx
        .services
        .child_resolver
        .resolve(&ctx.child_name, &resolved_include, &ctx.params)
        .await?;
    let child_blueprint = ctx.services.blueprint_loader.load(&info, &ctx.params).await?;

    let child_instance_id = match existing_child_id(ctx).await? {
        Some(id) => id,
        None => {
            let id = ctx.services.id_generator.generate();
            ctx.services
                .state
                .children()
                .attach(&ctx.parent_instance_id, &ctx.child_name, &id)
                .await?;
            id
        }
    };

    // Any ancestor instance re-appearing below itself is an include cycle.
    let parent_tree_path = parent_instance_tree_path(&ctx.params, &ctx.parent_instance_id);
    if parent_tree_path
        .split('/')
        .any(|ancestor| ancestor == child_instance_id)
    {
        return Err(Error::BlueprintCycleDetected {
            path: format!("{parent_tree_path}/{child_instance_id}"),
        });
    }

    let child_params = build_child_params(
        ctx,
        &resolved_include.variables,
        &child_instance_id,
        &parent_tree_path,
        &include_tree_path,
        &info,
    );

    let child_container =
        BlueprintContainer::for_child(ctx.services.clone(), child_blueprint);

    let changes = match &ctx.changes {
        Some(changes) => changes.clone(),
        None => {
            stage_child_changes(ctx, &child_container, &child_instance_id, &child_params).await?
        }
    };

    info!(
        child = %ctx.child_name,
        child_instance_id = %child_instance_id,
        "Deploying child blueprint"
    );
    let stream = child_container
        .deploy(
            DeployInput {
                instance_id: Some(child_instance_id.clone()),
                instance_name: None,
                changes,
                rollback_on_failure: false,
                force: false,
                drain_timeout: ctx.drain_timeout,
            },
            child_params,
            ctx.cancel.clone(),
        )
        .await?;

    forward_child_events(
        ctx.parent_instance_id.clone(),
        ctx.child_name.clone(),
        Some(ctx.group),
        &ctx.events,
        &ctx.forward,
        ctx.services.clone(),
        stream,
    )
    .await
}

/// Entry point for a child destroy worker.
pub(crate) async fn destroy_child(ctx: ChildDestroyCtx) {
    match destroy_inner(&ctx).await {
        Ok(()) => {}
        Err(error @ Error::StateStore(_)) => {
            let _ = ctx.errors.send(error).await;
        }
        Err(error) => {
            warn!(
                child = %ctx.child_name,
                error = %error,
                "Child blueprint destroy failed"
            );
            let _ = ctx
                .events
                .send(ChildDeployUpdateMessage {
                    parent_instance_id: ctx.parent_instance_id.clone(),
                    child_instance_id: String::new(),
                    child_name: ctx.child_name.clone(),
                    group: None,
                    status: InstanceStatus::DestroyFailed,
                    failure_reasons: vec![error.to_string()],
                    update_timestamp: ctx.services.clock.now(),
                })
                .await;
        }
    }
}

#[async_recursion]
async fn destroy_inner(ctx: &ChildDestroyCtx) -> Result<()> {
    let attached = ctx
        .services
        .state
        .children()
        .list(&ctx.parent_instance_id)
        .await?
        .into_iter()
        .find(|(name, _)| name == &ctx.child_name);
    let Some((_, child_instance_id)) = attached else {
        // Nothing attached: already removed.
        let _ = ctx
            .events
            .send(ChildDeployUpdateMessage {
                parent_instance_id: ctx.parent_instance_id.clone(),
                child_instance_id: String::new(),
                child_name: ctx.child_name.clone(),
                group: None,
                status: InstanceStatus::Destroyed,
                failure_reasons: Vec::new(),
                update_timestamp: ctx.services.clock.now(),
            })
            .await;
        return Ok(());
    };

    let changes = staging::derive_destroy_changes(&ctx.services, &child_instance_id).await?;
    // Destroys only read persisted state, no blueprint document needed.
    let child_container =
        BlueprintContainer::for_child(ctx.services.clone(), Blueprint::default());
    let stream = child_container
        .destroy(
            DestroyInput {
                instance_id: Some(child_instance_id.clone()),
                instance_name: None,
                changes,
                force: false,
                drain_timeout: ctx.drain_timeout,
            },
            ctx.params.clone(),
            ctx.cancel.clone(),
        )
        .await?;

    forward_child_events(
        ctx.parent_instance_id.clone(),
        ctx.child_name.clone(),
        None,
        &ctx.events,
        &ctx.forward,
        ctx.services.clone(),
        stream,
    )
    .await?;

    ctx.services
        .state
        .children()
        .detach(&ctx.parent_instance_id, &ctx.child_name)
        .await?;
    Ok(())
}

async fn existing_child_id(ctx: &ChildWorkerCtx) -> Result<Option<String>> {
    Ok(ctx
        .services
        .state
        .children()
        .list(&ctx.parent_instance_id)
        .await?
        .into_iter()
        .find(|(name, _)| name == &ctx.child_name)
        .map(|(_, id)| id))
}

fn parent_instance_tree_path(params: &BlueprintParams, parent_instance_id: &str) -> String {
    params
        .context_str(CONTEXT_INSTANCE_TREE_PATH)
        .map(str::to_string)
        .unwrap_or_else(|| parent_instance_id.to_string())
}

fn child_include_tree_path(params: &BlueprintParams, child_name: &str) -> String {
    match params.context_str(CONTEXT_INCLUDE_TREE_PATH) {
        Some(path) if !path.is_empty() => format!("{path}/{child_name}"),
        _ => child_name.to_string(),
    }
}

fn build_child_params(
    ctx: &ChildWorkerCtx,
    variables: &std::collections::HashMap<String, Value>,
    child_instance_id: &str,
    parent_tree_path: &str,
    include_tree_path: &str,
    info: &ChildBlueprintInfo,
) -> BlueprintParams {
    let mut context = ctx.params.context.clone();
    context.insert(
        CONTEXT_PARENT_INSTANCE_ID.to_string(),
        Value::String(ctx.parent_instance_id.clone()),
    );
    context.insert(
        CONTEXT_INSTANCE_TREE_PATH.to_string(),
        Value::String(format!("{parent_tree_path}/{child_instance_id}")),
    );
    context.insert(
        CONTEXT_INCLUDE_TREE_PATH.to_string(),
        Value::String(include_tree_path.to_string()),
    );
    if let ChildBlueprintInfo::AbsolutePath(path) = info {
        let dir = Path::new(path)
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        context.insert(CONTEXT_BLUEPRINT_DIR.to_string(), Value::String(dir));
    }
    BlueprintParams {
        variables: variables.clone(),
        context,
    }
}

/// Stage a fresh change set for a recreated child.
async fn stage_child_changes(
    ctx: &ChildWorkerCtx,
    child_container: &BlueprintContainer,
    child_instance_id: &str,
    child_params: &BlueprintParams,
) -> Result<BlueprintChanges> {
    let mut stream = child_container
        .stage_changes(
            StageChangesInput {
                instance_id: Some(child_instance_id.to_string()),
                instance_name: None,
                destroy: false,
                skip_drift_check: true,
            },
            child_params.clone(),
        )
        .await?;
    // Element messages are not needed here; dropping the receivers lets the
    // staging task run unimpeded.
    drop(stream.resource_changes);
    drop(stream.link_changes);
    drop(stream.child_changes);
    match (&mut stream.complete).await {
        Ok(changes) => Ok(changes),
        Err(_) => match stream.errors.recv().await {
            Some(error) => Err(error),
            None => Err(Error::Internal(format!(
                "staging ended without a change set for child {}",
                ctx.child_name
            ))),
        },
    }
}

/// Forward a child run's events upward until its terminal finish.
async fn forward_child_events(
    parent_instance_id: String,
    child_name: String,
    group: Option<usize>,
    events: &mpsc::Sender<ChildDeployUpdateMessage>,
    forward: &mpsc::Sender<DeployEvent>,
    services: Arc<ContainerServices>,
    mut stream: crate::DeployStream,
) -> Result<()> {
    loop {
        tokio::select! {
            event = stream.events.recv() => match event {
                Some(DeployEvent::DeploymentUpdate(update)) => {
                    let _ = events
                        .send(ChildDeployUpdateMessage {
                            parent_instance_id: parent_instance_id.clone(),
                            child_instance_id: update.instance_id.clone(),
                            child_name: child_name.clone(),
                            group,
                            status: update.status,
                            failure_reasons: Vec::new(),
                            update_timestamp: update.update_timestamp,
                        })
                        .await;
                }
                Some(DeployEvent::Finish(finish)) => {
                    let end_of_stream = finish.end_of_stream;
                    let _ = events
                        .send(ChildDeployUpdateMessage {
                            parent_instance_id: parent_instance_id.clone(),
                            child_instance_id: finish.instance_id.clone(),
                            child_name: child_name.clone(),
                            group,
                            status: finish.status,
                            failure_reasons: finish.failure_reasons.clone(),
                            update_timestamp: finish.finish_timestamp,
                        })
                        .await;
                    if end_of_stream {
                        return Ok(());
                    }
                }
                // Resource, link and grandchild events pass through verbatim
                // so UIs can attribute progress to the child instance.
                Some(other) => {
                    let _ = forward.send(other).await;
                }
                None => {
                    let _ = events
                        .send(ChildDeployUpdateMessage {
                            parent_instance_id: parent_instance_id.clone(),
                            child_instance_id: String::new(),
                            child_name: child_name.clone(),
                            group,
                            status: InstanceStatus::DeployFailed,
                            failure_reasons: vec![
                                "child run ended without a finish event".to_string()
                            ],
                            update_timestamp: services.clock.now(),
                        })
                        .await;
                    return Ok(());
                }
            },
            Some(error) = stream.errors.recv() => {
                return Err(error);
            }
        }
    }
}
