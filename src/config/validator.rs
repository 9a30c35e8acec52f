// src/config/validator.rs

//! Structural validation of a configuration tree.
//!
//! Runs once per request, before any resolution or write. Violations are
//! fatal configuration errors and are never retried.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::request::InputData;

use super::{ConfigNode, ConfigTree, ExclusionRule, FieldAction, MatchSource, MatchSpec, Step};

/// Validate `tree` against the request input.
///
/// Checks, across every node reachable from the roots (nested and
/// compound):
/// - each entity type appears at exactly one node;
/// - every root narrows its origin selection through `filter_keys`;
/// - every referenced input key is present in `input`;
/// - every `ResolveToCopied` target completes creation earlier in the
///   write phases' execution order than the node referencing it (all
///   direct subtrees across roots, then the compound pass);
/// - declarative match specs and exclusion conditions reference fields
///   that actually produce set-to-filter entries.
pub fn validate(tree: &ConfigTree, input: &InputData) -> Result<()> {
    if tree.roots().is_empty() {
        return Err(Error::Configuration(
            "configuration has no root nodes".to_string(),
        ));
    }

    let order = tree.execution_order()?;

    // Entity uniqueness and execution positions in one pass.
    let mut position: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, id) in order.iter().enumerate() {
        let node = tree.node(*id);
        if position.insert(node.entity.as_str(), idx).is_some() {
            return Err(Error::Configuration(format!(
                "entity type {} has been configured for copy several times",
                node.entity
            )));
        }
    }

    for root in tree.roots() {
        let node = tree.node(*root);
        if node.filter_keys.is_empty() {
            return Err(Error::Configuration(format!(
                "root config for {} must declare filter_keys to narrow the origin query",
                node.entity
            )));
        }
    }

    for (idx, id) in order.iter().enumerate() {
        let node = tree.node(*id);
        check_input_keys(node, input)?;
        check_fields(node, idx, &position)?;
        check_exclusion(tree, &order, node, &position)?;
    }

    debug!(nodes = order.len(), "configuration validated");
    Ok(())
}

fn require_input_key(input: &InputData, key: &str, context: &str) -> Result<()> {
    if input.contains_key(key) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{context} references input key {key}, but it is not present in input data"
        )))
    }
}

fn check_input_keys(node: &ConfigNode, input: &InputData) -> Result<()> {
    for (field, key) in &node.filter_keys {
        require_input_key(input, key, &format!("{} filter on {field}", node.entity))?;
    }
    for (field, action) in &node.fields {
        match action {
            FieldAction::CopyFromInput { key } => {
                require_input_key(input, key, &format!("{}.{field}", node.entity))?;
            }
            FieldAction::ResolveToExisting {
                match_spec: MatchSpec::Fields(filters),
                ..
            } => {
                for (filter_field, source) in filters {
                    if let MatchSource::Input { key } = source {
                        require_input_key(
                            input,
                            key,
                            &format!("{}.{field} match filter {filter_field}", node.entity),
                        )?;
                    }
                }
            }
            _ => {}
        }
    }
    for step in node.prepare_steps.iter().chain(&node.post_steps) {
        if let Step::DeleteByFilter(filters) = step {
            for (filter_field, key) in filters {
                require_input_key(
                    input,
                    key,
                    &format!("{} delete step filter {filter_field}", node.entity),
                )?;
            }
        }
    }
    Ok(())
}

fn check_fields(
    node: &ConfigNode,
    node_position: usize,
    position: &BTreeMap<&str, usize>,
) -> Result<()> {
    for (field, action) in &node.fields {
        match action {
            FieldAction::ResolveToCopied { entity } => {
                match position.get(entity.as_str()) {
                    Some(target) if *target < node_position => {}
                    Some(_) => {
                        return Err(Error::Configuration(format!(
                            "{}.{field} resolves to copied {entity}, which is not \
                             created earlier in execution order",
                            node.entity
                        )));
                    }
                    None => {
                        return Err(Error::Configuration(format!(
                            "{}.{field} resolves to copied {entity}, which is not \
                             configured for copy anywhere in the tree",
                            node.entity
                        )));
                    }
                }
            }
            FieldAction::ResolveToExisting { entity, match_spec } => {
                if entity.is_empty() {
                    return Err(Error::Configuration(format!(
                        "{}.{field} resolves to an unnamed entity type",
                        node.entity
                    )));
                }
                if let MatchSpec::Fields(filters) = match_spec
                    && filters.is_empty()
                {
                    return Err(Error::Configuration(format!(
                        "{}.{field} declares an empty match filter",
                        node.entity
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_exclusion(
    tree: &ConfigTree,
    order: &[super::NodeId],
    node: &ConfigNode,
    position: &BTreeMap<&str, usize>,
) -> Result<()> {
    let Some(ExclusionRule::Conditions(conditions)) = &node.exclusion else {
        return Ok(());
    };
    if conditions.is_empty() {
        return Err(Error::Configuration(format!(
            "exclusion rule on {} declares no conditions",
            node.entity
        )));
    }
    for condition in conditions {
        if !position.contains_key(condition.match_entity.as_str()) {
            return Err(Error::Configuration(format!(
                "exclusion on {} references {}, which is not configured for copy",
                node.entity, condition.match_entity
            )));
        }
        // The referenced field must actually produce set-to-filter entries.
        let owns_field = order
            .iter()
            .map(|id| tree.node(*id))
            .any(|n| {
                n.entity == condition.match_entity
                    && matches!(
                        n.fields.get(&condition.match_field),
                        Some(FieldAction::ResolveToExisting { .. })
                    )
            });
        if !owns_field {
            return Err(Error::Configuration(format!(
                "exclusion on {} references {}.{}, which is not a ResolveToExisting field",
                node.entity, condition.match_entity, condition.match_field
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldAction, IgnoreCondition};
    use crate::store::Value;

    fn base_input() -> InputData {
        let mut input = InputData::new();
        input.insert("project_id".to_string(), Value::Integer(1));
        input.insert("name".to_string(), Value::Text("copy".into()));
        input
    }

    #[test]
    fn test_accepts_minimal_tree() {
        let mut tree = ConfigTree::new();
        tree.add_root(
            ConfigNode::new("Project")
                .filter_key("id", "project_id")
                .field("name", FieldAction::from_input("name")),
        );
        assert!(validate(&tree, &base_input()).is_ok());
    }

    #[test]
    fn test_rejects_duplicate_entity() {
        let mut tree = ConfigTree::new();
        let child = tree.add(ConfigNode::new("Project"));
        tree.add_root(
            ConfigNode::new("Project")
                .filter_key("id", "project_id")
                .field("copies", FieldAction::nested(child, "parent_id")),
        );
        let err = validate(&tree, &base_input()).unwrap_err();
        assert!(err.to_string().contains("several times"));
    }

    #[test]
    fn test_rejects_missing_input_key() {
        let mut tree = ConfigTree::new();
        tree.add_root(
            ConfigNode::new("Project")
                .filter_key("id", "project_id")
                .field("name", FieldAction::from_input("missing_key")),
        );
        let err = validate(&tree, &base_input()).unwrap_err();
        assert!(err.to_string().contains("missing_key"));
    }

    #[test]
    fn test_rejects_rootless_config() {
        let tree = ConfigTree::new();
        assert!(validate(&tree, &base_input()).is_err());
    }

    #[test]
    fn test_rejects_root_without_filter_keys() {
        let mut tree = ConfigTree::new();
        tree.add_root(ConfigNode::new("Project").field("name", FieldAction::CopyFromOrigin));
        let err = validate(&tree, &base_input()).unwrap_err();
        assert!(err.to_string().contains("filter_keys"));
    }

    #[test]
    fn test_rejects_misordered_resolve_to_copied() {
        // Region is created before Route, so Region cannot reference Route.
        let mut tree = ConfigTree::new();
        let route = tree.add(ConfigNode::new("Route"));
        let region = tree.add(
            ConfigNode::new("Region").field("route_id", FieldAction::to_copied("Route")),
        );
        tree.add_root(
            ConfigNode::new("Project")
                .filter_key("id", "project_id")
                .field("regions", FieldAction::nested(region, "project_id"))
                .field("routes", FieldAction::nested(route, "project_id")),
        );
        let err = validate(&tree, &base_input()).unwrap_err();
        assert!(err.to_string().contains("not created earlier"));
    }

    #[test]
    fn test_rejects_resolve_to_copied_of_unconfigured_entity() {
        let mut tree = ConfigTree::new();
        tree.add_root(
            ConfigNode::new("Project")
                .filter_key("id", "project_id")
                .field("owner_id", FieldAction::to_copied("User")),
        );
        let err = validate(&tree, &base_input()).unwrap_err();
        assert!(err.to_string().contains("anywhere in the tree"));
    }

    #[test]
    fn test_accepts_compound_referencing_direct_nodes() {
        let mut tree = ConfigTree::new();
        let stop = tree.add(ConfigNode::new("Stop"));
        let route = tree.add(ConfigNode::new("Route"));
        let link = tree.add(
            ConfigNode::new("RouteStop")
                .field("route_id", FieldAction::to_copied("Route"))
                .field("stop_id", FieldAction::to_copied("Stop")),
        );
        tree.add_root(
            ConfigNode::new("Project")
                .filter_key("id", "project_id")
                .field("stops", FieldAction::nested(stop, "project_id"))
                .field("routes", FieldAction::nested(route, "project_id"))
                .compound_node(link),
        );
        assert!(validate(&tree, &base_input()).is_ok());
    }

    #[test]
    fn test_rejects_cross_root_reference_to_compound_entity() {
        // Tag records are created in the compound phase, after every
        // root's direct tree, so a second root cannot reference them.
        let mut tree = ConfigTree::new();
        let tag = tree.add(ConfigNode::new("Tag"));
        tree.add_root(
            ConfigNode::new("Item")
                .filter_key("project_id", "project_id")
                .compound_node(tag),
        );
        tree.add_root(
            ConfigNode::new("Note")
                .filter_key("project_id", "project_id")
                .field("tag_id", FieldAction::to_copied("Tag")),
        );
        let err = validate(&tree, &base_input()).unwrap_err();
        assert!(err.to_string().contains("not created earlier"));
    }

    #[test]
    fn test_accepts_compound_referencing_later_root() {
        // Direct trees of all roots complete before any compound node, so
        // a compound hanging off the first root may reference the second
        // root's entities.
        let mut tree = ConfigTree::new();
        let link = tree.add(
            ConfigNode::new("Link")
                .field("item_id", FieldAction::to_copied("Item"))
                .field("hub_id", FieldAction::to_copied("Hub")),
        );
        tree.add_root(
            ConfigNode::new("Item")
                .filter_key("project_id", "project_id")
                .compound_node(link),
        );
        tree.add_root(ConfigNode::new("Hub").filter_key("project_id", "project_id"));
        assert!(validate(&tree, &base_input()).is_ok());
    }

    #[test]
    fn test_rejects_exclusion_without_matching_field() {
        let mut tree = ConfigTree::new();
        tree.add_root(
            ConfigNode::new("Project")
                .filter_key("id", "project_id")
                .exclusion(ExclusionRule::Conditions(vec![IgnoreCondition::new(
                    "station_id",
                    "Project",
                    "station_id",
                )])),
        );
        let err = validate(&tree, &base_input()).unwrap_err();
        assert!(err.to_string().contains("not a ResolveToExisting field"));
    }
}
