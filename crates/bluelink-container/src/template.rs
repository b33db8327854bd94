//! Resource template expansion.
//!
//! A template resource (one with an `each` binding) expands into one
//! concrete resource per resolved item, named `{templateName}_{index}`.
//! Links declared against template names fan out across the expanded
//! resources; two linked templates must expand to the same length.

use bluelink_core::error::{Error, Result};
use bluelink_core::resolve::{
    BlueprintParams, LinkIntent, LinkOracle, ResolveStage, SubstitutionResolver,
    TemplateItemContext,
};
use bluelink_core::schema::Blueprint;
use std::collections::HashMap;

/// The blueprint after template expansion, with only concrete resources.
pub(crate) struct ExpandedBlueprint {
    pub blueprint: Blueprint,
    /// Concrete link intents after fanning out template links.
    pub links: Vec<LinkIntent>,
    /// Concrete resource name -> template it was expanded from.
    pub resource_templates: HashMap<String, String>,
    /// Concrete resource name -> bound template item, for resolution.
    pub template_items: HashMap<String, TemplateItemContext>,
}

pub(crate) fn concrete_template_name(template_name: &str, index: usize) -> String {
    format!("{template_name}_{index}")
}

pub(crate) async fn expand_resource_templates(
    blueprint: &Blueprint,
    stage: ResolveStage,
    resolver: &dyn SubstitutionResolver,
    link_oracle: &dyn LinkOracle,
    params: &BlueprintParams,
) -> Result<ExpandedBlueprint> {
    let mut template_item_lists: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    for (name, def) in &blueprint.resources {
        if def.each.is_some() {
            let items = resolver.resolve_each(stage, name, def, params).await?;
            template_item_lists.insert(name.clone(), items);
        }
    }

    let raw_links = link_oracle.links(blueprint);
    validate_linked_template_lengths(&raw_links, &template_item_lists)?;

    let mut expanded = Blueprint {
        metadata: blueprint.metadata.clone(),
        exports: blueprint.exports.clone(),
        includes: blueprint.includes.clone(),
        ..Default::default()
    };
    let mut resource_templates = HashMap::new();
    let mut template_items = HashMap::new();

    for (name, def) in &blueprint.resources {
        match template_item_lists.get(name) {
            None => {
                let mut concrete = def.clone();
                concrete.depends_on =
                    expand_dependency_names(&def.depends_on, &template_item_lists);
                expanded.resources.insert(name.clone(), concrete);
            }
            Some(items) => {
                for (index, item) in items.iter().enumerate() {
                    let concrete_name = concrete_template_name(name, index);
                    let mut concrete = def.clone();
                    concrete.each = None;
                    concrete.depends_on =
                        expand_dependency_names(&def.depends_on, &template_item_lists);
                    expanded.resources.insert(concrete_name.clone(), concrete);
                    resource_templates.insert(concrete_name.clone(), name.clone());
                    template_items.insert(
                        concrete_name,
                        TemplateItemContext {
                            template_name: name.clone(),
                            index,
                            item: item.clone(),
                        },
                    );
                }
            }
        }
    }

    let links = expand_link_intents(&raw_links, &template_item_lists);

    Ok(ExpandedBlueprint {
        blueprint: expanded,
        links,
        resource_templates,
        template_items,
    })
}

/// Linked templates must expand to the same length; pairing up the expanded
/// resources is otherwise ambiguous.
fn validate_linked_template_lengths(
    links: &[LinkIntent],
    template_item_lists: &HashMap<String, Vec<serde_json::Value>>,
) -> Result<()> {
    for link in links {
        let (Some(items_a), Some(items_b)) = (
            template_item_lists.get(&link.resource_a),
            template_item_lists.get(&link.resource_b),
        ) else {
            continue;
        };
        if items_a.len() != items_b.len() {
            return Err(Error::ResourceTemplateLinkLengthMismatch {
                template_a: link.resource_a.clone(),
                template_b: link.resource_b.clone(),
                len_a: items_a.len(),
                len_b: items_b.len(),
            });
        }
    }
    Ok(())
}

/// Dependencies on a template name become dependencies on every expanded
/// resource of that template.
fn expand_dependency_names(
    depends_on: &[String],
    template_item_lists: &HashMap<String, Vec<serde_json::Value>>,
) -> Vec<String> {
    let mut expanded = Vec::new();
    for dep in depends_on {
        match template_item_lists.get(dep) {
            None => expanded.push(dep.clone()),
            Some(items) => {
                expanded.extend((0..items.len()).map(|i| concrete_template_name(dep, i)));
            }
        }
    }
    expanded
}

fn expand_link_intents(
    links: &[LinkIntent],
    template_item_lists: &HashMap<String, Vec<serde_json::Value>>,
) -> Vec<LinkIntent> {
    let mut expanded = Vec::new();
    for link in links {
        let items_a = template_item_lists.get(&link.resource_a);
        let items_b = template_item_lists.get(&link.resource_b);
        match (items_a, items_b) {
            (None, None) => expanded.push(link.clone()),
            // Pairwise: lengths already validated equal.
            (Some(items_a), Some(_)) => {
                for index in 0..items_a.len() {
                    expanded.push(LinkIntent {
                        resource_a: concrete_template_name(&link.resource_a, index),
                        resource_b: concrete_template_name(&link.resource_b, index),
                    });
                }
            }
            (Some(items_a), None) => {
                for index in 0..items_a.len() {
                    expanded.push(LinkIntent {
                        resource_a: concrete_template_name(&link.resource_a, index),
                        resource_b: link.resource_b.clone(),
                    });
                }
            }
            (None, Some(items_b)) => {
                for index in 0..items_b.len() {
                    expanded.push(LinkIntent {
                        resource_a: link.resource_a.clone(),
                        resource_b: concrete_template_name(&link.resource_b, index),
                    });
                }
            }
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{blueprint_with_resources, StubOracle, StubResolver};
    use serde_json::json;

    #[tokio::test]
    async fn test_expands_templates_into_indexed_resources() {
        let blueprint = blueprint_with_resources(vec![
            ("ordersTable", "aws/dynamodb/table", Some(json!(["a", "b", "c"]))),
            ("saveOrderFunction", "aws/lambda/function", None),
        ]);
        let oracle = StubOracle::new(vec![("saveOrderFunction", "ordersTable")]);

        let expanded = expand_resource_templates(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &oracle,
            &BlueprintParams::default(),
        )
        .await
        .unwrap();

        assert_eq!(expanded.blueprint.resources.len(), 4);
        assert!(expanded.blueprint.resources.contains_key("ordersTable_0"));
        assert!(expanded.blueprint.resources.contains_key("ordersTable_2"));
        assert!(!expanded.blueprint.resources.contains_key("ordersTable"));
        assert_eq!(
            expanded.resource_templates.get("ordersTable_1").map(String::as_str),
            Some("ordersTable")
        );
        assert_eq!(expanded.template_items["ordersTable_1"].item, json!("b"));

        // The single function links to every expanded table.
        assert_eq!(expanded.links.len(), 3);
        assert!(expanded.links.contains(&LinkIntent {
            resource_a: "saveOrderFunction".into(),
            resource_b: "ordersTable_2".into(),
        }));
    }

    #[tokio::test]
    async fn test_linked_templates_of_equal_length_pair_up() {
        let blueprint = blueprint_with_resources(vec![
            ("queue", "aws/sqs/queue", Some(json!([1, 2]))),
            ("worker", "aws/lambda/function", Some(json!([3, 4]))),
        ]);
        let oracle = StubOracle::new(vec![("worker", "queue")]);

        let expanded = expand_resource_templates(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &oracle,
            &BlueprintParams::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            expanded.links,
            vec![
                LinkIntent {
                    resource_a: "worker_0".into(),
                    resource_b: "queue_0".into(),
                },
                LinkIntent {
                    resource_a: "worker_1".into(),
                    resource_b: "queue_1".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_linked_template_length_mismatch_fails() {
        let blueprint = blueprint_with_resources(vec![
            ("queue", "aws/sqs/queue", Some(json!([1, 2, 3]))),
            ("worker", "aws/lambda/function", Some(json!([4]))),
        ]);
        let oracle = StubOracle::new(vec![("worker", "queue")]);

        let result = expand_resource_templates(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &oracle,
            &BlueprintParams::default(),
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::ResourceTemplateLinkLengthMismatch {
                len_a: 1,
                len_b: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_dependencies_on_templates_fan_out() {
        let mut blueprint = blueprint_with_resources(vec![
            ("shard", "aws/dynamodb/table", Some(json!(["x", "y"]))),
            ("monitor", "aws/lambda/function", None),
        ]);
        blueprint
            .resources
            .get_mut("monitor")
            .unwrap()
            .depends_on = vec!["shard".into()];

        let expanded = expand_resource_templates(
            &blueprint,
            ResolveStage::ChangeStaging,
            &StubResolver::default(),
            &StubOracle::new(vec![]),
            &BlueprintParams::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            expanded.blueprint.resources["monitor"].depends_on,
            vec!["shard_0".to_string(), "shard_1".to_string()]
        );
    }
}
