//! Change staging: computing a `BlueprintChanges` set by diffing the
//! resolved blueprint against persisted instance state.
//!
//! For create/update staging, every element is resolved for change staging,
//! classified as new / modified / unchanged / removed, streamed to the
//! caller as it is classified, and aggregated into the final change set.
//! Unresolved substitutions accumulate into `resolve_on_deploy` rather than
//! being reported as removals. Child blueprints recurse with depth and
//! include-cycle enforcement. Destroy staging derives removals synchronously
//! from persisted state.

use crate::channels::{ChangeStagingStream, CHANNEL_CAPACITY};
use crate::config::MAX_BLUEPRINT_DEPTH;
use crate::template::expand_resource_templates;
use crate::ContainerServices;
use async_recursion::async_recursion;
use bluelink_core::changes::{
    BlueprintChanges, ExportChanges, FieldChange, LinkChanges, ResourceChanges,
};
use bluelink_core::events::{
    ChangeClassification, ChildChangesMessage, LinkChangesMessage, ResourceChangesMessage,
};
use bluelink_core::drift::DriftChecker;
use bluelink_core::provider::ProviderRegistry;
use bluelink_core::resolve::{
    BlueprintLoader, BlueprintParams, ChildResolver, ResolveStage, SubstitutionResolver,
};
use bluelink_core::schema::Blueprint;
use bluelink_core::state::{link_name, parse_resource_data_mapping_key, InstanceState};
use bluelink_core::status::InstanceStatus;
use bluelink_core::store::{InstancesContainer, StateContainer};
use bluelink_core::values::{diff_documents, extract_path, flatten_leaves};
use bluelink_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Input to [`crate::BlueprintContainer::stage_changes`].
#[derive(Debug, Clone, Default)]
pub struct StageChangesInput {
    pub instance_id: Option<String>,
    pub instance_name: Option<String>,
    /// Derive a destroy change set from persisted state instead of diffing
    /// the blueprint.
    pub destroy: bool,
    /// Skip the drift overlay even when a drift checker is configured.
    pub skip_drift_check: bool,
}

struct StagingEmitters {
    resource_tx: mpsc::Sender<ResourceChangesMessage>,
    link_tx: mpsc::Sender<LinkChangesMessage>,
    child_tx: mpsc::Sender<ChildChangesMessage>,
}

pub(crate) async fn start_staging(
    services: Arc<ContainerServices>,
    blueprint: Arc<Blueprint>,
    input: StageChangesInput,
    params: BlueprintParams,
) -> Result<ChangeStagingStream> {
    let instance_id = match (&input.instance_id, &input.instance_name) {
        (Some(id), _) => Some(id.clone()),
        (None, Some(name)) => {
            let found = services.state.instances().lookup_id_by_name(name).await?;
            if input.destroy && found.is_none() {
                return Err(Error::InstanceNotFound(name.clone()));
            }
            found
        }
        (None, None) => {
            if input.destroy {
                return Err(Error::MissingInstanceIdentifier);
            }
            None
        }
    };

    let (resource_tx, resource_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (link_tx, link_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (child_tx, child_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (complete_tx, complete_rx) = oneshot::channel();
    let (err_tx, err_rx) = mpsc::channel(4);

    let emitters = StagingEmitters {
        resource_tx,
        link_tx,
        child_tx,
    };
    let handle = tokio::spawn(run_staging(
        services,
        blueprint,
        instance_id,
        input,
        params,
        emitters,
        complete_tx,
        err_tx,
    ));

    Ok(ChangeStagingStream {
        resource_changes: resource_rx,
        link_changes: link_rx,
        child_changes: child_rx,
        complete: complete_rx,
        errors: err_rx,
        handle,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_staging(
    services: Arc<ContainerServices>,
    blueprint: Arc<Blueprint>,
    instance_id: Option<String>,
    input: StageChangesInput,
    params: BlueprintParams,
    emitters: StagingEmitters,
    complete_tx: oneshot::Sender<BlueprintChanges>,
    err_tx: mpsc::Sender<Error>,
) {
    let result = if input.destroy {
        stage_destroy(&services, instance_id.as_deref().unwrap_or_default(), &emitters).await
    } else {
        stage_for_deploy(
            &services,
            &blueprint,
            instance_id.as_deref(),
            &params,
            input.skip_drift_check,
            &emitters,
        )
        .await
    };
    match result {
        Ok(changes) => {
            let _ = complete_tx.send(changes);
        }
        Err(error) => {
            let _ = err_tx.send(error).await;
        }
    }
}

/// Destroy staging: collect everything persisted as removals.
async fn stage_destroy(
    services: &Arc<ContainerServices>,
    instance_id: &str,
    emitters: &StagingEmitters,
) -> Result<BlueprintChanges> {
    let changes = derive_destroy_changes(services, instance_id).await?;
    for name in &changes.removed_resources {
        let _ = emitters
            .resource_tx
            .send(ResourceChangesMessage {
                resource_name: name.clone(),
                classification: ChangeClassification::Removed,
                changes: None,
            })
            .await;
    }
    for name in &changes.removed_links {
        let _ = emitters
            .link_tx
            .send(LinkChangesMessage {
                link_name: name.clone(),
                classification: ChangeClassification::Removed,
                changes: None,
            })
            .await;
    }
    for name in &changes.removed_children {
        let _ = emitters
            .child_tx
            .send(ChildChangesMessage {
                child_name: name.clone(),
                classification: ChangeClassification::Removed,
                changes: None,
            })
            .await;
    }
    info!(
        instance_id = %instance_id,
        resources = changes.removed_resources.len(),
        links = changes.removed_links.len(),
        children = changes.removed_children.len(),
        "Staged destroy changes"
    );
    Ok(changes)
}

/// Build the removal change set for an instance from its persisted state.
/// Removal is closed over children: listing a child implies its own
/// resources and links go with it.
pub(crate) async fn derive_destroy_changes(
    services: &Arc<ContainerServices>,
    instance_id: &str,
) -> Result<BlueprintChanges> {
    let instance = services.state.instances().get(instance_id).await?;
    let mut changes = BlueprintChanges::default();
    changes.removed_resources = instance.resources.keys().cloned().collect();
    changes.removed_resources.sort();
    changes.removed_links = instance.links.keys().cloned().collect();
    changes.removed_links.sort();
    changes.removed_children = instance.child_instance_ids.keys().cloned().collect();
    changes.removed_children.sort();
    changes.removed_exports = instance.exports.keys().cloned().collect();
    changes.removed_exports.sort();
    Ok(changes)
}

/// Create/update staging at the root blueprint, streaming per-element
/// messages.
async fn stage_for_deploy(
    services: &Arc<ContainerServices>,
    blueprint: &Blueprint,
    instance_id: Option<&str>,
    params: &BlueprintParams,
    skip_drift_check: bool,
    emitters: &StagingEmitters,
) -> Result<BlueprintChanges> {
    let instance = match instance_id {
        Some(id) => match services.state.instances().get(id).await {
            Ok(instance) => Some(instance),
            Err(Error::InstanceNotFound(_)) => None,
            Err(error) => return Err(error),
        },
        None => None,
    };
    stage_blueprint(
        services,
        blueprint,
        instance.as_ref(),
        params,
        skip_drift_check,
        Some(emitters),
        &[],
        1,
    )
    .await
}

/// Whether a field path equals or falls under any of the given paths.
fn is_covered_by(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        path == prefix
            || path.starts_with(&format!("{prefix}."))
            || path.starts_with(&format!("{prefix}["))
    })
}

/// Whether a field path falls under any unresolved substitution path.
fn is_known_on_deploy(path: &str, unresolved: &[String]) -> bool {
    is_covered_by(path, unresolved)
}

#[allow(clippy::too_many_arguments)]
#[async_recursion]
async fn stage_blueprint(
    services: &Arc<ContainerServices>,
    blueprint: &Blueprint,
    instance: Option<&'async_recursion InstanceState>,
    params: &BlueprintParams,
    skip_drift_check: bool,
    emitters: Option<&'async_recursion StagingEmitters>,
    include_chain: &[String],
    depth: usize,
) -> Result<BlueprintChanges> {
    if depth > MAX_BLUEPRINT_DEPTH {
        return Err(Error::MaxBlueprintDepthExceeded {
            max: MAX_BLUEPRINT_DEPTH,
        });
    }

    let expanded = expand_resource_templates(
        blueprint,
        ResolveStage::ChangeStaging,
        services.resolver.as_ref(),
        services.link_oracle.as_ref(),
        params,
    )
    .await?;

    let drift_map = match (&services.drift_checker, instance, skip_drift_check) {
        (Some(checker), Some(instance), false) => checker.check_drift_with_state(instance).await?,
        _ => HashMap::new(),
    };

    let mut changes = BlueprintChanges::default();

    // Resources.
    for (name, def) in &expanded.blueprint.resources {
        let template = expanded.template_items.get(name);
        let resolved = services
            .resolver
            .resolve_resource(ResolveStage::ChangeStaging, name, def, params, template)
            .await?;
        for unresolved_path in &resolved.unresolved_paths {
            changes
                .resolve_on_deploy
                .push(format!("resources.{name}.{unresolved_path}"));
        }

        let persisted = instance.and_then(|instance| instance.resources.get(name));
        match persisted {
            None => {
                let resource_changes = ResourceChanges {
                    resource_type: def.resource_type.clone(),
                    new_fields: flatten_leaves(&resolved.spec)
                        .into_iter()
                        .map(|(path, value)| FieldChange {
                            field_path: path,
                            prev_value: None,
                            new_value: Some(value.clone()),
                        })
                        .collect(),
                    field_changes_known_on_deploy: resolved.unresolved_paths.clone(),
                    ..Default::default()
                };
                emit_resource(
                    emitters,
                    name,
                    ChangeClassification::New,
                    Some(&resource_changes),
                )
                .await;
                changes.new_resources.insert(name.clone(), resource_changes);
            }
            Some(state) => {
                let diff = diff_documents(&state.spec_data, &resolved.spec);
                let unresolved = &resolved.unresolved_paths;
                // Provider-computed fields and link-written fields exist only
                // on the persisted side of the diff.
                let mut externally_written = services
                    .providers
                    .resource_provider(&def.resource_type)
                    .map(|provider| provider.computed_fields())
                    .unwrap_or_default();
                if let Some(instance) = instance {
                    for link in instance.links.values() {
                        for mapping_key in link.resource_data_mappings.keys() {
                            if let Some((mapped_resource, field_path)) =
                                parse_resource_data_mapping_key(mapping_key)
                            {
                                if mapped_resource == name {
                                    externally_written.push(field_path.to_string());
                                }
                            }
                        }
                    }
                }

                let mut resource_changes = ResourceChanges {
                    resource_type: def.resource_type.clone(),
                    field_changes_known_on_deploy: unresolved.clone(),
                    ..Default::default()
                };
                for path in diff.added {
                    if is_known_on_deploy(&path, unresolved) {
                        continue;
                    }
                    resource_changes.new_fields.push(FieldChange {
                        field_path: path.clone(),
                        prev_value: None,
                        new_value: extract_path(&resolved.spec, &path).cloned(),
                    });
                }
                for path in diff.changed {
                    if is_known_on_deploy(&path, unresolved)
                        || is_covered_by(&path, &externally_written)
                    {
                        continue;
                    }
                    resource_changes.modified_fields.push(FieldChange {
                        field_path: path.clone(),
                        prev_value: extract_path(&state.spec_data, &path).cloned(),
                        new_value: extract_path(&resolved.spec, &path).cloned(),
                    });
                }
                // Fields that only resolve at deploy time must not be
                // reported as removed; neither are fields the provider or a
                // link wrote.
                resource_changes.removed_fields = diff
                    .removed
                    .into_iter()
                    .filter(|path| {
                        !is_known_on_deploy(path, unresolved)
                            && !is_covered_by(path, &externally_written)
                    })
                    .collect();
                resource_changes.unchanged_fields = diff.unchanged;

                // Drift surfaces as modifications against the drifted view.
                if let Some(drift) = drift_map.get(name) {
                    for field_change in &drift.difference {
                        let already = resource_changes
                            .modified_fields
                            .iter()
                            .any(|change| change.field_path == field_change.field_path);
                        if !already {
                            resource_changes.modified_fields.push(field_change.clone());
                        }
                    }
                }

                if resource_changes.has_changes() {
                    emit_resource(
                        emitters,
                        name,
                        ChangeClassification::Modified,
                        Some(&resource_changes),
                    )
                    .await;
                    changes.resource_changes.insert(name.clone(), resource_changes);
                } else {
                    emit_resource(emitters, name, ChangeClassification::Unchanged, None).await;
                    changes.unchanged_resources.push(name.clone());
                }
            }
        }
    }

    // Resources persisted but no longer declared.
    let mut removed_resources: HashSet<String> = HashSet::new();
    if let Some(instance) = instance {
        for name in instance.resources.keys() {
            if !expanded.blueprint.resources.contains_key(name) {
                removed_resources.insert(name.clone());
                emit_resource(emitters, name, ChangeClassification::Removed, None).await;
                changes.removed_resources.push(name.clone());
            }
        }
        changes.removed_resources.sort();

        // Survivors that depended on a removed resource must re-flow even
        // though their own spec did not change.
        for (name, state) in &instance.resources {
            if removed_resources.contains(name)
                || !expanded.blueprint.resources.contains_key(name)
            {
                continue;
            }
            let depends_on_removed = state
                .depends_on_resources
                .iter()
                .any(|dep| removed_resources.contains(dep));
            if !depends_on_removed {
                continue;
            }
            if let Some(position) = changes
                .unchanged_resources
                .iter()
                .position(|unchanged| unchanged == name)
            {
                changes.unchanged_resources.remove(position);
            }
            let entry = changes
                .resource_changes
                .entry(name.clone())
                .or_insert_with(|| ResourceChanges {
                    resource_type: expanded.blueprint.resources[name].resource_type.clone(),
                    ..Default::default()
                });
            entry.must_recreate = true;
            emit_resource(emitters, name, ChangeClassification::Recreate, Some(entry)).await;
            debug!(resource = %name, "Forcing recreate, a dependency was removed");
        }
    }

    // Links.
    let desired_links: HashMap<String, (String, String)> = expanded
        .links
        .iter()
        .map(|intent| {
            (
                link_name(&intent.resource_a, &intent.resource_b),
                (intent.resource_a.clone(), intent.resource_b.clone()),
            )
        })
        .collect();
    for (name, (resource_a, resource_b)) in &desired_links {
        let persisted = instance.and_then(|instance| instance.links.get(name));
        let link_changes = LinkChanges {
            resource_a: resource_a.clone(),
            resource_b: resource_b.clone(),
            ..Default::default()
        };
        match persisted {
            None => {
                emit_link(emitters, name, ChangeClassification::New, Some(&link_changes)).await;
                changes.new_links.insert(name.clone(), link_changes);
            }
            Some(_) => {
                // A link re-flows when either endpoint is being deployed;
                // its concrete field changes are provider-computed at deploy
                // time.
                let endpoint_staged = changes.deploys_resource(resource_a)
                    || changes.deploys_resource(resource_b);
                if endpoint_staged {
                    emit_link(
                        emitters,
                        name,
                        ChangeClassification::Modified,
                        Some(&link_changes),
                    )
                    .await;
                    changes.link_changes.insert(name.clone(), link_changes);
                }
            }
        }
    }
    if let Some(instance) = instance {
        for name in instance.links.keys() {
            if !desired_links.contains_key(name) {
                emit_link(emitters, name, ChangeClassification::Removed, None).await;
                changes.removed_links.push(name.clone());
            }
        }
        changes.removed_links.sort();
    }

    // Child blueprints, recursively.
    for (name, def) in &expanded.blueprint.includes {
        let resolved_include = services
            .resolver
            .resolve_include(ResolveStage::ChangeStaging, name, def, params)
            .await?;
        if include_chain
            .iter()
            .any(|ancestor| ancestor == &resolved_include.path)
        {
            return Err(Error::BlueprintCycleDetected {
                path: format!("{}/{}", include_chain.join("/"), resolved_include.path),
            });
        }
        let info = services
            .child_resolver
            .resolve(name, &resolved_include, params)
            .await?;
        let child_blueprint = services.blueprint_loader.load(&info, params).await?;

        let child_instance = match instance.and_then(|instance| {
            instance.child_instance_ids.get(name).cloned()
        }) {
            Some(child_instance_id) => {
                match services.state.instances().get(&child_instance_id).await {
                    Ok(child_instance) => Some(child_instance),
                    Err(Error::InstanceNotFound(_)) => None,
                    Err(error) => return Err(error),
                }
            }
            None => None,
        };

        let child_params = BlueprintParams {
            variables: resolved_include.variables.clone(),
            context: params.context.clone(),
        };
        let mut child_chain: Vec<String> = include_chain.to_vec();
        child_chain.push(resolved_include.path.clone());
        let child_changes = stage_blueprint(
            services,
            &child_blueprint,
            child_instance.as_ref(),
            &child_params,
            skip_drift_check,
            None,
            &child_chain,
            depth + 1,
        )
        .await?;

        match &child_instance {
            None => {
                emit_child(emitters, name, ChangeClassification::New, Some(&child_changes))
                    .await;
                changes.new_children.insert(name.clone(), child_changes);
            }
            // A half-destroyed child cannot be updated in place.
            Some(existing) if existing.status == InstanceStatus::DestroyFailed => {
                emit_child(emitters, name, ChangeClassification::Recreate, None).await;
                changes.recreate_children.push(name.clone());
            }
            Some(_) => {
                if child_changes.is_empty() {
                    emit_child(emitters, name, ChangeClassification::Unchanged, None).await;
                } else {
                    emit_child(
                        emitters,
                        name,
                        ChangeClassification::Modified,
                        Some(&child_changes),
                    )
                    .await;
                    changes.child_changes.insert(name.clone(), child_changes);
                }
            }
        }
    }
    if let Some(instance) = instance {
        for name in instance.child_instance_ids.keys() {
            if !expanded.blueprint.includes.contains_key(name) {
                emit_child(emitters, name, ChangeClassification::Removed, None).await;
                changes.removed_children.push(name.clone());
            }
        }
        changes.removed_children.sort();
    }

    // Exports.
    for (name, def) in &blueprint.exports {
        let resolved = services
            .resolver
            .resolve_export(ResolveStage::ChangeStaging, name, def, params)
            .await?;
        if resolved.unresolved {
            changes.resolve_on_deploy.push(format!("exports.{name}"));
        }
        let persisted = instance.and_then(|instance| instance.exports.get(name));
        match persisted {
            None => {
                changes.new_exports.insert(
                    name.clone(),
                    ExportChanges {
                        field: def.field.clone(),
                        prev_value: None,
                        new_value: resolved.value,
                        known_on_deploy: resolved.unresolved,
                    },
                );
            }
            Some(state) => {
                if resolved.unresolved {
                    changes.export_changes.insert(
                        name.clone(),
                        ExportChanges {
                            field: def.field.clone(),
                            prev_value: Some(state.value.clone()),
                            new_value: None,
                            known_on_deploy: true,
                        },
                    );
                } else if resolved.value.as_ref() == Some(&state.value) {
                    changes.unchanged_exports.push(name.clone());
                } else {
                    changes.export_changes.insert(
                        name.clone(),
                        ExportChanges {
                            field: def.field.clone(),
                            prev_value: Some(state.value.clone()),
                            new_value: resolved.value,
                            known_on_deploy: false,
                        },
                    );
                }
            }
        }
    }
    if let Some(instance) = instance {
        for name in instance.exports.keys() {
            if !blueprint.exports.contains_key(name) {
                changes.removed_exports.push(name.clone());
            }
        }
        changes.removed_exports.sort();
    }

    Ok(changes)
}

async fn emit_resource(
    emitters: Option<&StagingEmitters>,
    name: &str,
    classification: ChangeClassification,
    changes: Option<&ResourceChanges>,
) {
    if let Some(emitters) = emitters {
        let _ = emitters
            .resource_tx
            .send(ResourceChangesMessage {
                resource_name: name.to_string(),
                classification,
                changes: changes.cloned(),
            })
            .await;
    }
}

async fn emit_link(
    emitters: Option<&StagingEmitters>,
    name: &str,
    classification: ChangeClassification,
    changes: Option<&LinkChanges>,
) {
    if let Some(emitters) = emitters {
        let _ = emitters
            .link_tx
            .send(LinkChangesMessage {
                link_name: name.to_string(),
                classification,
                changes: changes.cloned(),
            })
            .await;
    }
}

async fn emit_child(
    emitters: Option<&StagingEmitters>,
    name: &str,
    classification: ChangeClassification,
    changes: Option<&BlueprintChanges>,
) {
    if let Some(emitters) = emitters {
        let _ = emitters
            .child_tx
            .send(ChildChangesMessage {
                child_name: name.to_string(),
                classification,
                changes: changes.cloned(),
            })
            .await;
    }
}
