//! Reconciliation: inspecting and correcting interrupted or drifted state
//! outside the normal deploy flow.
//!
//! `check` walks an instance (and optionally its children, carrying a
//! dot-joined child path) and produces per-element results with the observed
//! external state, the field-level differences and a recommended action.
//! `apply` executes user-chosen actions per element: accepting external
//! state (with propagation into link data via the persisted resource data
//! mappings), updating status only, or marking the element failed.

use crate::ContainerServices;
use async_recursion::async_recursion;
use bluelink_core::changes::FieldChange;
use bluelink_core::drift::{DriftChecker, InterruptedResourceCheck};
use bluelink_core::state::{parse_resource_data_mapping_key, InstanceState};
use bluelink_core::status::{
    ElementOperation, LinkStatus, PreciseLinkStatus, PreciseResourceStatus,
};
use bluelink_core::store::{
    ChildrenContainer, InstancesContainer, LinkStatusInfo, LinksContainer, ResourceStatusInfo,
    ResourcesContainer, StateContainer,
};
use bluelink_core::values::{diff_documents, extract_path, inject_path};
use bluelink_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Which elements a reconciliation check covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileScope {
    /// Elements whose last operation was interrupted.
    Interrupted,
    /// Elements with a persisted drift record.
    Drift,
    /// Interrupted and drifted elements, plus a live state refresh of the
    /// rest.
    All,
    /// Only the elements named in the input.
    Specific,
}

/// Why an element shows up in a check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileType {
    Interrupted,
    Drift,
    StateRefresh,
}

/// The action recommended (or requested) for an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Overwrite persisted state with the external state, clear drift and
    /// propagate into dependent link data.
    AcceptExternal,
    /// Persist only a status correction; leave drift records intact.
    UpdateStatus,
    /// Persist a failed status with a synthetic failure reason; leave drift
    /// intact.
    MarkFailed,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationCheckInput {
    pub instance_id: String,
    pub scope: Option<ReconcileScope>,
    pub include_children: bool,
    /// Dot-joined child path filter, e.g. `networking.subnets`.
    pub child_path_filter: Option<String>,
    /// Resource names for [`ReconcileScope::Specific`].
    pub resource_names: Vec<String>,
    /// Link names for [`ReconcileScope::Specific`].
    pub link_names: Vec<String>,
}

/// A pre-computed link data correction implied by accepting a resource's
/// external state.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDataUpdate {
    pub link_name: String,
    pub data_path: String,
    pub new_value: Value,
}

#[derive(Debug, Clone)]
pub struct ResourceReconcileResult {
    pub instance_id: String,
    /// Dot-joined child names from the root; empty at the root.
    pub child_path: String,
    pub resource_name: String,
    pub reconcile_type: ReconcileType,
    pub old_status: PreciseResourceStatus,
    pub new_status: PreciseResourceStatus,
    pub external_state: Option<Value>,
    pub persisted_state: Value,
    pub changes: Vec<FieldChange>,
    pub recommended_action: ReconcileAction,
    pub link_data_updates: Vec<LinkDataUpdate>,
}

#[derive(Debug, Clone)]
pub struct LinkReconcileResult {
    pub instance_id: String,
    pub child_path: String,
    pub link_name: String,
    pub reconcile_type: ReconcileType,
    pub old_status: PreciseLinkStatus,
    pub new_status: PreciseLinkStatus,
    pub external_data: Option<Value>,
    pub persisted_data: Value,
    pub changes: Vec<FieldChange>,
    pub recommended_action: ReconcileAction,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationCheckResult {
    pub resources: Vec<ResourceReconcileResult>,
    pub links: Vec<LinkReconcileResult>,
}

/// One element action within [`ApplyReconciliationInput`].
#[derive(Debug, Clone)]
pub struct ReconcileActionRequest {
    /// Dot-joined child path; empty for the root instance.
    pub child_path: String,
    pub element: ReconcileElement,
    pub action: ReconcileAction,
    /// External state to accept, required for
    /// [`ReconcileAction::AcceptExternal`].
    pub external_state: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum ReconcileElement {
    Resource {
        name: String,
        new_status: Option<PreciseResourceStatus>,
    },
    Link {
        name: String,
        new_status: Option<PreciseLinkStatus>,
    },
}

impl ReconcileElement {
    fn name(&self) -> &str {
        match self {
            ReconcileElement::Resource { name, .. } | ReconcileElement::Link { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReconciliationInput {
    pub instance_id: String,
    pub actions: Vec<ReconcileActionRequest>,
}

#[derive(Debug, Clone)]
pub struct AppliedReconciliation {
    pub child_path: String,
    pub element_name: String,
    pub action: ReconcileAction,
    /// Set when applying this element failed; other elements still apply.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationApplyResult {
    pub applied: Vec<AppliedReconciliation>,
}

/// Failure reason recorded by [`ReconcileAction::MarkFailed`].
const MARKED_FAILED_REASON: &str = "Marked as failed during reconciliation";

pub(crate) async fn check(
    services: Arc<ContainerServices>,
    input: ReconciliationCheckInput,
) -> Result<ReconciliationCheckResult> {
    let mut result = ReconciliationCheckResult::default();
    check_instance(&services, &input, &input.instance_id, "", &mut result).await?;
    Ok(result)
}

fn path_included(child_path: &str, filter: &Option<String>) -> bool {
    match filter {
        None => true,
        Some(filter) if filter.is_empty() => true,
        Some(filter) => {
            child_path == filter || child_path.starts_with(&format!("{filter}."))
        }
    }
}

#[async_recursion]
async fn check_instance(
    services: &Arc<ContainerServices>,
    input: &'async_recursion ReconciliationCheckInput,
    instance_id: &'async_recursion str,
    child_path: &'async_recursion str,
    out: &'async_recursion mut ReconciliationCheckResult,
) -> Result<()> {
    let instance = services.state.instances().get(instance_id).await?;
    let scope = input.scope.unwrap_or(ReconcileScope::All);

    if path_included(child_path, &input.child_path_filter) {
        match scope {
            ReconcileScope::Interrupted => {
                check_interrupted(services, &instance, child_path, out).await?;
            }
            ReconcileScope::Drift => {
                check_drift_records(services, &instance, child_path, out).await?;
            }
            ReconcileScope::All => {
                check_interrupted(services, &instance, child_path, out).await?;
                check_drift_records(services, &instance, child_path, out).await?;
                check_state_refresh(services, &instance, child_path, out).await?;
            }
            ReconcileScope::Specific => {
                check_specific(services, input, &instance, child_path, out).await?;
            }
        }
    }

    if input.include_children {
        for (child_name, child_instance_id) in
            services.state.children().list(instance_id).await?
        {
            let nested_path = if child_path.is_empty() {
                child_name
            } else {
                format!("{child_path}.{child_name}")
            };
            check_instance(services, input, &child_instance_id, &nested_path, out).await?;
        }
    }
    Ok(())
}

fn interrupted_operation(status: PreciseResourceStatus) -> ElementOperation {
    match status {
        PreciseResourceStatus::UpdateInterrupted => ElementOperation::Update,
        PreciseResourceStatus::DestroyInterrupted => ElementOperation::Destroy,
        _ => ElementOperation::Create,
    }
}

fn field_changes(persisted: &Value, external: &Value) -> Vec<FieldChange> {
    let diff = diff_documents(persisted, external);
    let mut changes = Vec::new();
    for path in diff.added {
        changes.push(FieldChange {
            new_value: extract_path(external, &path).cloned(),
            field_path: path,
            prev_value: None,
        });
    }
    for path in diff.changed {
        changes.push(FieldChange {
            prev_value: extract_path(persisted, &path).cloned(),
            new_value: extract_path(external, &path).cloned(),
            field_path: path,
        });
    }
    for path in diff.removed {
        changes.push(FieldChange {
            prev_value: extract_path(persisted, &path).cloned(),
            field_path: path,
            new_value: None,
        });
    }
    changes
}

/// Pre-compute the link data corrections that accepting `external` for a
/// resource implies, using the persisted resource data mappings.
async fn link_data_updates_for(
    services: &Arc<ContainerServices>,
    instance_id: &str,
    resource_name: &str,
    external: &Value,
) -> Result<Vec<LinkDataUpdate>> {
    let mut updates = Vec::new();
    let links = services
        .state
        .links()
        .list_with_resource_data_mappings(instance_id, resource_name)
        .await?;
    for link in links {
        for (mapping_key, data_path) in &link.resource_data_mappings {
            let Some((mapped_resource, field_path)) = parse_resource_data_mapping_key(mapping_key)
            else {
                continue;
            };
            if mapped_resource != resource_name {
                continue;
            }
            if let Some(value) = extract_path(external, field_path) {
                updates.push(LinkDataUpdate {
                    link_name: link.name.clone(),
                    data_path: data_path.clone(),
                    new_value: value.clone(),
                });
            }
        }
    }
    Ok(updates)
}

async fn check_interrupted(
    services: &Arc<ContainerServices>,
    instance: &InstanceState,
    child_path: &str,
    out: &mut ReconciliationCheckResult,
) -> Result<()> {
    let interrupted_resources: Vec<&str> = instance
        .resources
        .values()
        .filter(|resource| resource.precise_status.is_interrupted())
        .map(|resource| resource.name.as_str())
        .collect();
    if !interrupted_resources.is_empty() {
        let checker = services.drift_checker.as_ref().ok_or_else(|| {
            Error::DriftCheckFailed("a drift checker is required to reconcile interrupted state".into())
        })?;
        let checks: HashMap<String, InterruptedResourceCheck> = checker
            .check_interrupted_resources_with_state(instance)
            .await?
            .into_iter()
            .map(|check| (check.resource_name.clone(), check))
            .collect();
        for resource_name in interrupted_resources {
            let resource = &instance.resources[resource_name];
            let operation = interrupted_operation(resource.precise_status);
            let check = checks.get(resource_name);
            let (recommended, new_status, external) = match check {
                Some(check) if check.exists && check.stabilised => (
                    ReconcileAction::AcceptExternal,
                    PreciseResourceStatus::succeeded(operation),
                    check.external_spec.clone(),
                ),
                Some(check) if check.exists => (
                    ReconcileAction::UpdateStatus,
                    PreciseResourceStatus::failed(operation),
                    check.external_spec.clone(),
                ),
                _ => (
                    ReconcileAction::MarkFailed,
                    PreciseResourceStatus::failed(operation),
                    None,
                ),
            };
            let changes = external
                .as_ref()
                .map(|external| field_changes(&resource.spec_data, external))
                .unwrap_or_default();
            let link_data_updates = match (&recommended, &external) {
                (ReconcileAction::AcceptExternal, Some(external)) => {
                    link_data_updates_for(services, &instance.instance_id, resource_name, external)
                        .await?
                }
                _ => Vec::new(),
            };
            out.resources.push(ResourceReconcileResult {
                instance_id: instance.instance_id.clone(),
                child_path: child_path.to_string(),
                resource_name: resource_name.to_string(),
                reconcile_type: ReconcileType::Interrupted,
                old_status: resource.precise_status,
                new_status,
                external_state: external,
                persisted_state: resource.spec_data.clone(),
                changes,
                recommended_action: recommended,
                link_data_updates,
            });
        }
    }

    for link in instance.links.values() {
        if !link.precise_status.is_interrupted() {
            continue;
        }
        let new_status = match link.precise_status {
            PreciseLinkStatus::ResourceAUpdateInterrupted => {
                PreciseLinkStatus::ResourceAUpdateFailed
            }
            PreciseLinkStatus::ResourceBUpdateInterrupted => {
                PreciseLinkStatus::ResourceBUpdateFailed
            }
            _ => PreciseLinkStatus::IntermediaryResourceUpdateFailed,
        };
        out.links.push(LinkReconcileResult {
            instance_id: instance.instance_id.clone(),
            child_path: child_path.to_string(),
            link_name: link.name.clone(),
            reconcile_type: ReconcileType::Interrupted,
            old_status: link.precise_status,
            new_status,
            external_data: None,
            persisted_data: link.data.clone(),
            changes: Vec::new(),
            recommended_action: ReconcileAction::UpdateStatus,
        });
    }
    Ok(())
}

async fn check_drift_records(
    services: &Arc<ContainerServices>,
    instance: &InstanceState,
    child_path: &str,
    out: &mut ReconciliationCheckResult,
) -> Result<()> {
    for resource in instance.resources.values() {
        let Some(drift) = services
            .state
            .resources()
            .get_drift(&instance.instance_id, &resource.name)
            .await?
        else {
            continue;
        };
        let link_data_updates = link_data_updates_for(
            services,
            &instance.instance_id,
            &resource.name,
            &drift.spec_data,
        )
        .await?;
        out.resources.push(ResourceReconcileResult {
            instance_id: instance.instance_id.clone(),
            child_path: child_path.to_string(),
            resource_name: resource.name.clone(),
            reconcile_type: ReconcileType::Drift,
            old_status: resource.precise_status,
            new_status: resource.precise_status,
            external_state: Some(drift.spec_data.clone()),
            persisted_state: resource.spec_data.clone(),
            changes: drift.difference.clone(),
            recommended_action: ReconcileAction::AcceptExternal,
            link_data_updates,
        });
    }
    for link in instance.links.values() {
        let Some(drift) = services
            .state
            .links()
            .get_drift(&instance.instance_id, &link.name)
            .await?
        else {
            continue;
        };
        out.links.push(LinkReconcileResult {
            instance_id: instance.instance_id.clone(),
            child_path: child_path.to_string(),
            link_name: link.name.clone(),
            reconcile_type: ReconcileType::Drift,
            old_status: link.precise_status,
            new_status: link.precise_status,
            external_data: Some(drift.data.clone()),
            persisted_data: link.data.clone(),
            changes: drift.difference.clone(),
            recommended_action: ReconcileAction::AcceptExternal,
        });
    }
    Ok(())
}

/// Live drift check for elements not otherwise covered.
async fn check_state_refresh(
    services: &Arc<ContainerServices>,
    instance: &InstanceState,
    child_path: &str,
    out: &mut ReconciliationCheckResult,
) -> Result<()> {
    let Some(checker) = services.drift_checker.as_ref() else {
        return Ok(());
    };
    for resource in instance.resources.values() {
        if resource.precise_status.is_interrupted() {
            continue;
        }
        let already_covered = out
            .resources
            .iter()
            .any(|existing| {
                existing.child_path == child_path && existing.resource_name == resource.name
            });
        if already_covered {
            continue;
        }
        let Some(drift) = checker.check_resource_drift(resource).await? else {
            continue;
        };
        let link_data_updates = link_data_updates_for(
            services,
            &instance.instance_id,
            &resource.name,
            &drift.spec_data,
        )
        .await?;
        out.resources.push(ResourceReconcileResult {
            instance_id: instance.instance_id.clone(),
            child_path: child_path.to_string(),
            resource_name: resource.name.clone(),
            reconcile_type: ReconcileType::StateRefresh,
            old_status: resource.precise_status,
            new_status: resource.precise_status,
            external_state: Some(drift.spec_data.clone()),
            persisted_state: resource.spec_data.clone(),
            changes: drift.difference.clone(),
            recommended_action: ReconcileAction::AcceptExternal,
            link_data_updates,
        });
    }
    for link in instance.links.values() {
        if link.precise_status.is_interrupted() {
            continue;
        }
        let already_covered = out
            .links
            .iter()
            .any(|existing| existing.child_path == child_path && existing.link_name == link.name);
        if already_covered {
            continue;
        }
        let Some(drift) = checker.check_link_drift(link).await? else {
            continue;
        };
        out.links.push(LinkReconcileResult {
            instance_id: instance.instance_id.clone(),
            child_path: child_path.to_string(),
            link_name: link.name.clone(),
            reconcile_type: ReconcileType::StateRefresh,
            old_status: link.precise_status,
            new_status: link.precise_status,
            external_data: Some(drift.data.clone()),
            persisted_data: link.data.clone(),
            changes: drift.difference.clone(),
            recommended_action: ReconcileAction::AcceptExternal,
        });
    }
    Ok(())
}

async fn check_specific(
    services: &Arc<ContainerServices>,
    input: &ReconciliationCheckInput,
    instance: &InstanceState,
    child_path: &str,
    out: &mut ReconciliationCheckResult,
) -> Result<()> {
    // Narrow the instance view to the named elements and reuse the scoped
    // checks over it.
    let mut narrowed = instance.clone();
    narrowed
        .resources
        .retain(|name, _| input.resource_names.iter().any(|wanted| wanted == name));
    narrowed
        .links
        .retain(|name, _| input.link_names.iter().any(|wanted| wanted == name));
    let has_interrupted = narrowed
        .resources
        .values()
        .any(|resource| resource.precise_status.is_interrupted())
        || narrowed
            .links
            .values()
            .any(|link| link.precise_status.is_interrupted());
    if has_interrupted {
        check_interrupted(services, &narrowed, child_path, out).await?;
    }
    check_drift_records(services, &narrowed, child_path, out).await?;
    check_state_refresh(services, &narrowed, child_path, out).await?;
    Ok(())
}

pub(crate) async fn apply(
    services: Arc<ContainerServices>,
    input: ApplyReconciliationInput,
) -> Result<ReconciliationApplyResult> {
    let mut result = ReconciliationApplyResult::default();
    for request in &input.actions {
        let outcome = async {
            let instance_id =
                resolve_child_instance(&services, &input.instance_id, &request.child_path).await?;
            apply_one(&services, &instance_id, request).await
        }
        .await;
        result.applied.push(AppliedReconciliation {
            child_path: request.child_path.clone(),
            element_name: request.element.name().to_string(),
            action: request.action,
            error: outcome.err().map(|error| error.to_string()),
        });
    }
    Ok(result)
}

/// Walk a dot-joined child path down to the instance it names.
async fn resolve_child_instance(
    services: &Arc<ContainerServices>,
    root_instance_id: &str,
    child_path: &str,
) -> Result<String> {
    let mut current = root_instance_id.to_string();
    if child_path.is_empty() {
        return Ok(current);
    }
    for segment in child_path.split('.') {
        let attached = services
            .state
            .children()
            .list(&current)
            .await?
            .into_iter()
            .find(|(name, _)| name == segment);
        match attached {
            Some((_, child_instance_id)) => current = child_instance_id,
            None => return Err(Error::InstanceNotFound(format!("{root_instance_id}:{child_path}"))),
        }
    }
    Ok(current)
}

async fn apply_one(
    services: &Arc<ContainerServices>,
    instance_id: &str,
    request: &ReconcileActionRequest,
) -> Result<()> {
    match &request.element {
        ReconcileElement::Resource { name, new_status } => {
            apply_resource(services, instance_id, name, *new_status, request).await
        }
        ReconcileElement::Link { name, new_status } => {
            apply_link(services, instance_id, name, *new_status, request).await
        }
    }
}

async fn apply_resource(
    services: &Arc<ContainerServices>,
    instance_id: &str,
    resource_name: &str,
    new_status: Option<PreciseResourceStatus>,
    request: &ReconcileActionRequest,
) -> Result<()> {
    match request.action {
        ReconcileAction::AcceptExternal => {
            let external = request.external_state.clone().ok_or_else(|| {
                Error::Internal("external state is required to accept it".into())
            })?;
            let mut resource = services
                .state
                .resources()
                .get(instance_id, resource_name)
                .await?;
            resource.spec_data = external.clone();
            resource.drifted = false;
            resource.failure_reasons = Vec::new();
            if let Some(status) = new_status {
                resource.precise_status = status;
                resource.status = status.coarse();
            }
            services.state.resources().save(resource).await?;
            services
                .state
                .resources()
                .remove_drift(instance_id, resource_name)
                .await?;

            // Propagate the accepted state into every link whose data
            // mappings reference this resource.
            let links = services
                .state
                .links()
                .list_with_resource_data_mappings(instance_id, resource_name)
                .await?;
            for mut link in links {
                let mut changed = false;
                let mappings = link.resource_data_mappings.clone();
                for (mapping_key, data_path) in &mappings {
                    let Some((mapped_resource, field_path)) =
                        parse_resource_data_mapping_key(mapping_key)
                    else {
                        continue;
                    };
                    if mapped_resource != resource_name {
                        continue;
                    }
                    if let Some(value) = extract_path(&external, field_path) {
                        if inject_path(&mut link.data, data_path, value.clone()) {
                            changed = true;
                        }
                    }
                }
                if changed {
                    services.state.links().save(link).await?;
                }
            }
            info!(
                instance_id = %instance_id,
                resource = %resource_name,
                "Accepted external state"
            );
            Ok(())
        }
        ReconcileAction::UpdateStatus => {
            let status = new_status.ok_or_else(|| {
                Error::Internal("a new status is required to update status".into())
            })?;
            services
                .state
                .resources()
                .update_status(
                    instance_id,
                    resource_name,
                    ResourceStatusInfo {
                        status: status.coarse(),
                        precise_status: status,
                        ..Default::default()
                    },
                )
                .await
        }
        ReconcileAction::MarkFailed => {
            let current = services
                .state
                .resources()
                .get(instance_id, resource_name)
                .await?;
            let status = new_status.unwrap_or_else(|| {
                PreciseResourceStatus::failed(interrupted_operation(current.precise_status))
            });
            services
                .state
                .resources()
                .update_status(
                    instance_id,
                    resource_name,
                    ResourceStatusInfo {
                        status: status.coarse(),
                        precise_status: status,
                        failure_reasons: Some(vec![MARKED_FAILED_REASON.to_string()]),
                        ..Default::default()
                    },
                )
                .await
        }
    }
}

async fn apply_link(
    services: &Arc<ContainerServices>,
    instance_id: &str,
    link_name: &str,
    new_status: Option<PreciseLinkStatus>,
    request: &ReconcileActionRequest,
) -> Result<()> {
    let current = services.state.links().get(instance_id, link_name).await?;
    match request.action {
        ReconcileAction::AcceptExternal => {
            let external = request.external_state.clone().ok_or_else(|| {
                Error::Internal("external state is required to accept it".into())
            })?;
            let mut link = current;
            link.data = external;
            link.drifted = false;
            link.failure_reasons = Vec::new();
            if let Some(status) = new_status {
                link.precise_status = status;
            }
            services.state.links().save(link).await?;
            services
                .state
                .links()
                .remove_drift(instance_id, link_name)
                .await?;
            Ok(())
        }
        ReconcileAction::UpdateStatus => {
            let status = new_status.ok_or_else(|| {
                Error::Internal("a new status is required to update status".into())
            })?;
            services
                .state
                .links()
                .update_status(
                    instance_id,
                    link_name,
                    LinkStatusInfo {
                        status: current.status,
                        precise_status: status,
                        ..Default::default()
                    },
                )
                .await
        }
        ReconcileAction::MarkFailed => {
            let status = new_status.unwrap_or(PreciseLinkStatus::IntermediaryResourceUpdateFailed);
            services
                .state
                .links()
                .update_status(
                    instance_id,
                    link_name,
                    LinkStatusInfo {
                        status: LinkStatus::UpdateFailed,
                        precise_status: status,
                        failure_reasons: Some(vec![MARKED_FAILED_REASON.to_string()]),
                        ..Default::default()
                    },
                )
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        blueprint_with_resources, harness, test_registry, StubChildResolver, StubDriftChecker,
        StubLoader, StubOracle, StubResolver,
    };
    use bluelink_core::drift::{InterruptedResourceCheck, ResourceDriftState};
    use bluelink_core::state::{
        link_name, resource_data_mapping_key, InstanceState, LinkState, ResourceState,
    };
    use bluelink_core::status::InstanceStatus;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    async fn seeded_drift_harness() -> (crate::BlueprintContainer, Arc<bluelink_memstate::MemoryStateContainer>)
    {
        let (container, state) = harness(
            blueprint_with_resources(vec![]),
            test_registry(),
            StubOracle::new(vec![]),
            StubLoader::default(),
        );

        let link = link_name("resourceA", "resourceB");
        let mut instance = InstanceState {
            instance_id: "inst-1".into(),
            instance_name: Some("drifted".into()),
            status: InstanceStatus::Deployed,
            ..Default::default()
        };
        instance.resources.insert(
            "resourceA".into(),
            ResourceState {
                resource_id: "res-a".into(),
                name: "resourceA".into(),
                resource_type: "aws/lambda/function".into(),
                instance_id: "inst-1".into(),
                spec_data: json!({"handler": "old"}),
                drifted: true,
                ..Default::default()
            },
        );
        instance.links.insert(
            link.clone(),
            LinkState {
                link_id: "link-1".into(),
                name: link,
                instance_id: "inst-1".into(),
                data: json!({"resourceA": {"handler": "old"}}),
                resource_data_mappings: StdHashMap::from([(
                    resource_data_mapping_key("resourceA", "handler"),
                    "resourceA.handler".to_string(),
                )]),
                drifted: true,
                ..Default::default()
            },
        );
        state.instances().save(instance).await.unwrap();
        state
            .resources()
            .save_drift(ResourceDriftState {
                instance_id: "inst-1".into(),
                resource_id: "res-a".into(),
                resource_name: "resourceA".into(),
                spec_data: json!({"handler": "new"}),
                difference: vec![FieldChange {
                    field_path: "handler".into(),
                    prev_value: Some(json!("old")),
                    new_value: Some(json!("new")),
                }],
                checked_at: None,
            })
            .await
            .unwrap();
        (container, state)
    }

    #[tokio::test]
    async fn test_check_drift_recommends_accept_with_link_updates() {
        let (container, _state) = seeded_drift_harness().await;

        let result = container
            .check_reconciliation(ReconciliationCheckInput {
                instance_id: "inst-1".into(),
                scope: Some(ReconcileScope::Drift),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.resources.len(), 1);
        let resource = &result.resources[0];
        assert_eq!(resource.reconcile_type, ReconcileType::Drift);
        assert_eq!(resource.recommended_action, ReconcileAction::AcceptExternal);
        assert_eq!(resource.external_state, Some(json!({"handler": "new"})));
        assert_eq!(
            resource.link_data_updates,
            vec![LinkDataUpdate {
                link_name: link_name("resourceA", "resourceB"),
                data_path: "resourceA.handler".into(),
                new_value: json!("new"),
            }]
        );
    }

    /// Accepting external state overwrites the persisted spec, clears drift
    /// and propagates the value into the link data at the mapped path.
    #[tokio::test]
    async fn test_accept_external_propagates_into_link_data() {
        let (container, state) = seeded_drift_harness().await;
        let link = link_name("resourceA", "resourceB");

        let result = container
            .apply_reconciliation(ApplyReconciliationInput {
                instance_id: "inst-1".into(),
                actions: vec![
                    ReconcileActionRequest {
                        child_path: String::new(),
                        element: ReconcileElement::Resource {
                            name: "resourceA".into(),
                            new_status: None,
                        },
                        action: ReconcileAction::AcceptExternal,
                        external_state: Some(json!({"handler": "new"})),
                    },
                    ReconcileActionRequest {
                        child_path: String::new(),
                        element: ReconcileElement::Link {
                            name: link.clone(),
                            new_status: None,
                        },
                        action: ReconcileAction::AcceptExternal,
                        external_state: Some(json!({"resourceA": {"handler": "new"}})),
                    },
                ],
            })
            .await
            .unwrap();
        assert!(result.applied.iter().all(|applied| applied.error.is_none()));

        let resource = state.resources().get("inst-1", "resourceA").await.unwrap();
        assert_eq!(resource.spec_data, json!({"handler": "new"}));
        assert!(!resource.drifted);
        assert!(state
            .resources()
            .get_drift("inst-1", "resourceA")
            .await
            .unwrap()
            .is_none());

        let link_state = state.links().get("inst-1", &link).await.unwrap();
        assert_eq!(link_state.data["resourceA"]["handler"], json!("new"));
        assert!(!link_state.drifted);
    }

    #[tokio::test]
    async fn test_interrupted_resources_get_recommendations() {
        let (container, state) = {
            let state = Arc::new(bluelink_memstate::MemoryStateContainer::new());
            let drift_checker = Arc::new(StubDriftChecker {
                interrupted: vec![
                    InterruptedResourceCheck {
                        resource_name: "stableOne".into(),
                        exists: true,
                        external_spec: Some(json!({"handler": "live"})),
                        stabilised: true,
                    },
                    InterruptedResourceCheck {
                        resource_name: "goneOne".into(),
                        exists: false,
                        external_spec: None,
                        stabilised: false,
                    },
                ],
            });
            let services = crate::ContainerServices::new(
                state.clone(),
                Arc::new(test_registry()),
                Arc::new(StubResolver),
                Arc::new(StubChildResolver),
                Arc::new(StubLoader::default()),
                Arc::new(StubOracle::new(vec![])),
            )
            .with_drift_checker(drift_checker);
            (
                crate::BlueprintContainer::new(services, blueprint_with_resources(vec![])),
                state,
            )
        };

        let mut instance = InstanceState {
            instance_id: "inst-1".into(),
            status: InstanceStatus::DeployFailed,
            ..Default::default()
        };
        for name in ["stableOne", "goneOne"] {
            instance.resources.insert(
                name.into(),
                ResourceState {
                    resource_id: format!("res-{name}"),
                    name: name.into(),
                    resource_type: "aws/lambda/function".into(),
                    instance_id: "inst-1".into(),
                    precise_status: PreciseResourceStatus::CreateInterrupted,
                    spec_data: json!({"handler": "persisted"}),
                    ..Default::default()
                },
            );
        }
        state.instances().save(instance).await.unwrap();

        let result = container
            .check_reconciliation(ReconciliationCheckInput {
                instance_id: "inst-1".into(),
                scope: Some(ReconcileScope::Interrupted),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.resources.len(), 2);
        let stable = result
            .resources
            .iter()
            .find(|resource| resource.resource_name == "stableOne")
            .unwrap();
        assert_eq!(stable.recommended_action, ReconcileAction::AcceptExternal);
        assert_eq!(stable.new_status, PreciseResourceStatus::Created);
        assert!(stable
            .changes
            .iter()
            .any(|change| change.field_path == "handler"));

        let gone = result
            .resources
            .iter()
            .find(|resource| resource.resource_name == "goneOne")
            .unwrap();
        assert_eq!(gone.recommended_action, ReconcileAction::MarkFailed);
        assert_eq!(gone.new_status, PreciseResourceStatus::CreateFailed);
    }

    #[tokio::test]
    async fn test_mark_failed_records_synthetic_reason() {
        let (container, state) = seeded_drift_harness().await;
        let result = container
            .apply_reconciliation(ApplyReconciliationInput {
                instance_id: "inst-1".into(),
                actions: vec![ReconcileActionRequest {
                    child_path: String::new(),
                    element: ReconcileElement::Resource {
                        name: "resourceA".into(),
                        new_status: Some(PreciseResourceStatus::CreateFailed),
                    },
                    action: ReconcileAction::MarkFailed,
                    external_state: None,
                }],
            })
            .await
            .unwrap();
        assert!(result.applied[0].error.is_none());

        let resource = state.resources().get("inst-1", "resourceA").await.unwrap();
        assert_eq!(resource.precise_status, PreciseResourceStatus::CreateFailed);
        assert_eq!(
            resource.failure_reasons,
            vec![MARKED_FAILED_REASON.to_string()]
        );
        // MarkFailed leaves the drift record intact.
        assert!(state
            .resources()
            .get_drift("inst-1", "resourceA")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_child_paths_are_walked_recursively() {
        let (container, state) = harness(
            blueprint_with_resources(vec![]),
            test_registry(),
            StubOracle::new(vec![]),
            StubLoader::default(),
        );

        state
            .instances()
            .save(InstanceState {
                instance_id: "root".into(),
                status: InstanceStatus::Deployed,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut child = InstanceState {
            instance_id: "child-1".into(),
            status: InstanceStatus::Deployed,
            ..Default::default()
        };
        child.resources.insert(
            "nestedTable".into(),
            ResourceState {
                resource_id: "res-nested".into(),
                name: "nestedTable".into(),
                resource_type: "aws/dynamodb/table".into(),
                instance_id: "child-1".into(),
                spec_data: json!({"tableName": "old"}),
                ..Default::default()
            },
        );
        state.instances().save(child).await.unwrap();
        state
            .children()
            .attach("root", "networking", "child-1")
            .await
            .unwrap();
        state
            .resources()
            .save_drift(ResourceDriftState {
                instance_id: "child-1".into(),
                resource_id: "res-nested".into(),
                resource_name: "nestedTable".into(),
                spec_data: json!({"tableName": "renamed"}),
                difference: vec![],
                checked_at: None,
            })
            .await
            .unwrap();

        let result = container
            .check_reconciliation(ReconciliationCheckInput {
                instance_id: "root".into(),
                scope: Some(ReconcileScope::Drift),
                include_children: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.resources.len(), 1);
        assert_eq!(result.resources[0].child_path, "networking");

        // Applying through the child path resolves the nested instance.
        let applied = container
            .apply_reconciliation(ApplyReconciliationInput {
                instance_id: "root".into(),
                actions: vec![ReconcileActionRequest {
                    child_path: "networking".into(),
                    element: ReconcileElement::Resource {
                        name: "nestedTable".into(),
                        new_status: None,
                    },
                    action: ReconcileAction::AcceptExternal,
                    external_state: Some(json!({"tableName": "renamed"})),
                }],
            })
            .await
            .unwrap();
        assert!(applied.applied[0].error.is_none());
        let nested = state.resources().get("child-1", "nestedTable").await.unwrap();
        assert_eq!(nested.spec_data, json!({"tableName": "renamed"}));
    }
}
