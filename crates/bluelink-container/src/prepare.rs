//! Deployment preparation.
//!
//! Expands templates, builds the reference graph over concrete elements and
//! partitions it into ordered parallel groups by longest-path depth. Each
//! node carries its direct dependencies and the subset that must be fully
//! stabilised before the node may start.

use crate::run_state::{ElementId, ElementKind};
use crate::template::{expand_resource_templates, ExpandedBlueprint};
use bluelink_core::error::{Error, Result};
use bluelink_core::provider::{ProviderRegistry, ResourceProvider};
use bluelink_core::resolve::{BlueprintParams, LinkOracle, ResolveStage, SubstitutionResolver};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// What a deployment node schedules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Resource { resource_type: String },
    Child,
}

/// One schedulable element of the blueprint.
#[derive(Debug, Clone)]
pub(crate) struct DeploymentNode {
    pub name: String,
    pub kind: NodeKind,
    pub direct_dependencies: Vec<ElementId>,
    /// Names of direct dependencies that must be fully stabilised, not
    /// merely config-complete, before this node may start.
    pub stabilised_dependencies: HashSet<String>,
    /// Parallel group index the node was assigned to.
    pub group: usize,
}

impl DeploymentNode {
    pub fn element_id(&self) -> ElementId {
        match self.kind {
            NodeKind::Resource { .. } => ElementId::resource(self.name.clone()),
            NodeKind::Child => ElementId::child(self.name.clone()),
        }
    }
}

/// The prepared execution plan for a run.
pub(crate) struct PreparedPlan {
    pub expanded: ExpandedBlueprint,
    /// Nodes partitioned into parallel groups: everything in group `k` only
    /// depends on nodes in groups `< k`.
    pub groups: Vec<Vec<DeploymentNode>>,
    /// Resource name -> provider implementing its type.
    pub providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl PreparedPlan {
    pub fn node(&self, id: &ElementId) -> Option<&DeploymentNode> {
        self.groups
            .iter()
            .flatten()
            .find(|node| &node.element_id() == id)
    }
}

pub(crate) async fn prepare(
    blueprint: &bluelink_core::schema::Blueprint,
    stage: ResolveStage,
    resolver: &dyn SubstitutionResolver,
    link_oracle: &dyn LinkOracle,
    registry: &dyn ProviderRegistry,
    params: &BlueprintParams,
) -> Result<PreparedPlan> {
    let expanded =
        expand_resource_templates(blueprint, stage, resolver, link_oracle, params).await?;

    let mut dependencies: HashMap<ElementId, Vec<ElementId>> = HashMap::new();
    let resource_names: HashSet<&String> = expanded.blueprint.resources.keys().collect();
    let include_names: HashSet<&String> = expanded.blueprint.includes.keys().collect();

    let classify = |name: &str| -> Option<ElementId> {
        if resource_names.contains(&name.to_string()) {
            Some(ElementId::resource(name))
        } else if include_names.contains(&name.to_string()) {
            Some(ElementId::child(name))
        } else {
            None
        }
    };

    for (name, def) in &expanded.blueprint.resources {
        let mut deps = Vec::new();
        for dep in &def.depends_on {
            if let Some(id) = classify(dep) {
                deps.push(id);
            }
        }
        for referenced in resolver.resource_references(name, def) {
            if let Some(id) = classify(&referenced) {
                deps.push(id);
            }
        }
        dependencies.insert(ElementId::resource(name.clone()), dedup(deps));
    }
    for (name, def) in &expanded.blueprint.includes {
        let mut deps = Vec::new();
        for referenced in resolver.include_references(name, def) {
            if let Some(id) = classify(&referenced) {
                deps.push(id);
            }
        }
        dependencies.insert(ElementId::child(name.clone()), dedup(deps));
    }

    // A link orders its endpoints: the second endpoint must exist before the
    // first may be configured against it.
    for link in &expanded.links {
        let dependent = ElementId::resource(link.resource_a.clone());
        let dependency = ElementId::resource(link.resource_b.clone());
        if let Some(deps) = dependencies.get_mut(&dependent) {
            if !deps.contains(&dependency) {
                deps.push(dependency);
            }
        }
    }

    detect_cycles(&dependencies)?;
    let waves = assign_waves(&dependencies);

    let mut providers: HashMap<String, Arc<dyn ResourceProvider>> = HashMap::new();
    for (name, def) in &expanded.blueprint.resources {
        let provider = registry
            .resource_provider(&def.resource_type)
            .ok_or_else(|| Error::ProviderNotFound(def.resource_type.clone()))?;
        providers.insert(name.clone(), provider);
    }

    let group_count = waves.values().copied().max().map_or(0, |max| max + 1);
    let mut groups: Vec<Vec<DeploymentNode>> = vec![Vec::new(); group_count];
    for (id, deps) in &dependencies {
        let group = waves[id];
        let node = match id.kind {
            ElementKind::Resource => {
                let resource_type = expanded.blueprint.resources[&id.name].resource_type.clone();
                let stabilised = stabilised_dependency_names(
                    &providers[&id.name],
                    deps,
                    &expanded.blueprint,
                );
                DeploymentNode {
                    name: id.name.clone(),
                    kind: NodeKind::Resource { resource_type },
                    direct_dependencies: deps.clone(),
                    stabilised_dependencies: stabilised,
                    group,
                }
            }
            _ => DeploymentNode {
                name: id.name.clone(),
                kind: NodeKind::Child,
                direct_dependencies: deps.clone(),
                stabilised_dependencies: HashSet::new(),
                group,
            },
        };
        groups[group].push(node);
    }
    for group in &mut groups {
        group.sort_by(|a, b| a.name.cmp(&b.name));
    }

    Ok(PreparedPlan {
        expanded,
        groups,
        providers,
    })
}

fn dedup(deps: Vec<ElementId>) -> Vec<ElementId> {
    let mut seen = HashSet::new();
    deps.into_iter().filter(|dep| seen.insert(dep.clone())).collect()
}

/// Resource-type based stabilisation requirements, resolved to concrete
/// dependency names.
fn stabilised_dependency_names(
    provider: &Arc<dyn ResourceProvider>,
    deps: &[ElementId],
    blueprint: &bluelink_core::schema::Blueprint,
) -> HashSet<String> {
    let required_types: HashSet<String> = provider.stabilised_dependencies().into_iter().collect();
    if required_types.is_empty() {
        return HashSet::new();
    }
    deps.iter()
        .filter(|dep| dep.kind == ElementKind::Resource)
        .filter(|dep| {
            blueprint
                .resources
                .get(&dep.name)
                .is_some_and(|def| required_types.contains(&def.resource_type))
        })
        .map(|dep| dep.name.clone())
        .collect()
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// DFS colour-marking over the dependency graph.
fn detect_cycles(dependencies: &HashMap<ElementId, Vec<ElementId>>) -> Result<()> {
    let mut colours: HashMap<&ElementId, Colour> =
        dependencies.keys().map(|id| (id, Colour::White)).collect();

    fn visit<'a>(
        id: &'a ElementId,
        dependencies: &'a HashMap<ElementId, Vec<ElementId>>,
        colours: &mut HashMap<&'a ElementId, Colour>,
    ) -> Result<()> {
        match colours.get(id).copied() {
            Some(Colour::Black) | None => return Ok(()),
            Some(Colour::Grey) => {
                return Err(Error::ReferenceCycleDetected(id.name.clone()));
            }
            Some(Colour::White) => {}
        }
        colours.insert(id, Colour::Grey);
        if let Some(deps) = dependencies.get(id) {
            for dep in deps {
                visit(dep, dependencies, colours)?;
            }
        }
        colours.insert(id, Colour::Black);
        Ok(())
    }

    let ids: Vec<&ElementId> = dependencies.keys().collect();
    for id in ids {
        visit(id, dependencies, &mut colours)?;
    }
    Ok(())
}

/// Longest-path wave assignment: a node's wave is one past the deepest wave
/// among its dependencies; nodes with no dependencies land in wave 0.
fn assign_waves(dependencies: &HashMap<ElementId, Vec<ElementId>>) -> HashMap<ElementId, usize> {
    fn wave_of(
        id: &ElementId,
        dependencies: &HashMap<ElementId, Vec<ElementId>>,
        waves: &mut HashMap<ElementId, usize>,
    ) -> usize {
        if let Some(wave) = waves.get(id) {
            return *wave;
        }
        let wave = dependencies
            .get(id)
            .map(|deps| {
                deps.iter()
                    .map(|dep| wave_of(dep, dependencies, waves) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        waves.insert(id.clone(), wave);
        wave
    }

    let mut waves = HashMap::new();
    for id in dependencies.keys() {
        wave_of(id, dependencies, &mut waves);
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        blueprint_with_resources, test_registry, StubOracle, StubResolver, TestResourceProvider,
    };
    use serde_json::json;

    fn group_names(plan: &PreparedPlan, group: usize) -> Vec<String> {
        plan.groups[group]
            .iter()
            .map(|node| node.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_waves_follow_link_implied_order() {
        // Three expanded tables feed one function: tables in wave 0, the
        // function (which links to all of them) in wave 1.
        let blueprint = blueprint_with_resources(vec![
            ("ordersTable", "aws/dynamodb/table", Some(json!([1, 2, 3]))),
            ("saveOrderFunction", "aws/lambda/function", None),
        ]);
        let oracle = StubOracle::new(vec![("saveOrderFunction", "ordersTable")]);

        let plan = prepare(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &oracle,
            &test_registry(),
            &BlueprintParams::default(),
        )
        .await
        .unwrap();

        assert_eq!(plan.groups.len(), 2);
        assert_eq!(
            group_names(&plan, 0),
            vec!["ordersTable_0", "ordersTable_1", "ordersTable_2"]
        );
        assert_eq!(group_names(&plan, 1), vec!["saveOrderFunction"]);

        let function = plan
            .node(&ElementId::resource("saveOrderFunction"))
            .unwrap();
        assert_eq!(function.direct_dependencies.len(), 3);
    }

    #[tokio::test]
    async fn test_depends_on_chains_stack_waves() {
        let mut blueprint = blueprint_with_resources(vec![
            ("a", "aws/dynamodb/table", None),
            ("b", "aws/dynamodb/table", None),
            ("c", "aws/dynamodb/table", None),
        ]);
        blueprint.resources.get_mut("b").unwrap().depends_on = vec!["a".into()];
        blueprint.resources.get_mut("c").unwrap().depends_on = vec!["b".into()];

        let plan = prepare(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &StubOracle::new(vec![]),
            &test_registry(),
            &BlueprintParams::default(),
        )
        .await
        .unwrap();

        assert_eq!(plan.groups.len(), 3);
        assert_eq!(group_names(&plan, 0), vec!["a"]);
        assert_eq!(group_names(&plan, 1), vec!["b"]);
        assert_eq!(group_names(&plan, 2), vec!["c"]);
    }

    #[tokio::test]
    async fn test_dependency_cycle_is_rejected() {
        let mut blueprint = blueprint_with_resources(vec![
            ("a", "aws/dynamodb/table", None),
            ("b", "aws/dynamodb/table", None),
        ]);
        blueprint.resources.get_mut("a").unwrap().depends_on = vec!["b".into()];
        blueprint.resources.get_mut("b").unwrap().depends_on = vec!["a".into()];

        let result = prepare(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &StubOracle::new(vec![]),
            &test_registry(),
            &BlueprintParams::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::ReferenceCycleDetected(_))));
    }

    #[tokio::test]
    async fn test_missing_provider_is_rejected() {
        let blueprint =
            blueprint_with_resources(vec![("a", "custom/unknown/type", None)]);

        let result = prepare(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &StubOracle::new(vec![]),
            &test_registry(),
            &BlueprintParams::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::ProviderNotFound(t)) if t == "custom/unknown/type"));
    }

    #[tokio::test]
    async fn test_stabilised_dependencies_resolved_by_type() {
        let mut blueprint = blueprint_with_resources(vec![
            ("table", "aws/dynamodb/table", None),
            ("stream", "aws/kinesis/stream", None),
            ("function", "aws/lambda/function", None),
        ]);
        blueprint.resources.get_mut("function").unwrap().depends_on =
            vec!["table".into(), "stream".into()];

        let registry = test_registry().with_resource_provider(std::sync::Arc::new(
            TestResourceProvider::new("aws/lambda/function")
                .with_stabilised_dependencies(vec!["aws/kinesis/stream".into()]),
        ));

        let plan = prepare(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &StubOracle::new(vec![]),
            &registry,
            &BlueprintParams::default(),
        )
        .await
        .unwrap();

        let function = plan.node(&ElementId::resource("function")).unwrap();
        assert!(function.stabilised_dependencies.contains("stream"));
        assert!(!function.stabilised_dependencies.contains("table"));
    }
}
