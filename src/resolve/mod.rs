// src/resolve/mod.rs

//! Read-only resolution pass.
//!
//! Walks the configuration tree exactly like the create phase will, but
//! performs no writes: it computes the match map (set-to-filter) and the
//! excluded map (ignore conditions) for the entire tree, so the engine can
//! decide whether to proceed and the caller can review ambiguities before
//! anything is written. Given unchanged origin data and input, the pass is
//! fully deterministic.

mod ignore;
pub(crate) mod selection;
mod set_to_filter;

pub(crate) use selection::{AffectedMap, Selector};

use tracing::{debug, info};

use crate::config::{ConfigTree, FieldAction, NodeId};
use crate::error::Result;
use crate::request::{ExcludedMap, InputData, MatchMap};
use crate::store::{Filter, Record, Store, id_values};

/// Output of the resolution pass: the diagnostic maps for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub match_map: MatchMap,
    pub excluded_map: ExcludedMap,
}

impl Resolution {
    /// True when some set-to-filter reference has no destination match.
    pub fn has_unmatched(&self) -> bool {
        self.match_map
            .values()
            .flat_map(|fields| fields.values())
            .flat_map(|field_map| field_map.values())
            .any(Option::is_none)
    }
}

/// Resolve the whole tree against the store.
pub fn resolve(tree: &ConfigTree, store: &dyn Store, input: &InputData) -> Result<Resolution> {
    let mut pass = Pass {
        selector: Selector::new(tree, store, input),
        match_map: MatchMap::new(),
        affected: AffectedMap::new(),
        selections: vec![Vec::new(); tree.len()],
        ignore_nodes: Vec::new(),
    };

    // Mirror the write phases: every root's direct tree before any
    // compound node, so compound scoping sees all affected entities.
    for root in tree.roots() {
        pass.walk_direct(*root, None)?;
    }
    for root in tree.roots() {
        pass.walk_compound(*root)?;
    }
    let excluded_map = pass.resolve_exclusions(input)?;

    info!(
        entities = pass.match_map.len(),
        excluded_entities = excluded_map.len(),
        "resolution pass complete"
    );
    Ok(Resolution {
        match_map: pass.match_map,
        excluded_map,
    })
}

struct Pass<'a> {
    selector: Selector<'a>,
    match_map: MatchMap,
    affected: AffectedMap,
    selections: Vec<Vec<Record>>,
    ignore_nodes: Vec<NodeId>,
}

impl Pass<'_> {
    fn walk_direct(&mut self, id: NodeId, scope: Option<&Filter>) -> Result<()> {
        let node = self.selector.tree.node(id);
        let records = self.selector.select(node, scope, None)?;
        self.process(id, records)
    }

    fn process(&mut self, id: NodeId, records: Vec<Record>) -> Result<()> {
        let tree = self.selector.tree;
        let node = tree.node(id);
        debug!(entity = %node.entity, records = records.len(), "resolving node");

        self.affected
            .entry(node.entity.clone())
            .or_default()
            .extend(records.iter().map(|r| r.id.clone()));

        for (field, action) in &node.fields {
            if let FieldAction::ResolveToExisting { entity, match_spec } = action {
                let field_map = set_to_filter::resolve_field(
                    self.selector.store,
                    node,
                    field,
                    entity,
                    match_spec,
                    &records,
                    self.selector.input,
                )?;
                self.match_map
                    .entry(node.entity.clone())
                    .or_default()
                    .insert(field.clone(), field_map);
            }
        }

        if node.exclusion.is_some() {
            self.ignore_nodes.push(id);
        }
        self.selections[id.0] = records;

        let children: Vec<(NodeId, String)> = node
            .nested_children()
            .map(|(_, child, fk)| (child, fk.to_string()))
            .collect();
        for (child, foreign_key) in children {
            let parent_ids: Vec<String> = self.selections[id.0]
                .iter()
                .map(|r| r.id.clone())
                .collect();
            let scope = Filter::is_in(foreign_key, id_values(&parent_ids));
            self.walk_direct(child, Some(&scope))?;
        }
        Ok(())
    }

    fn walk_compound(&mut self, id: NodeId) -> Result<()> {
        let tree = self.selector.tree;
        let children: Vec<NodeId> = tree.node(id).nested_children().map(|(_, c, _)| c).collect();
        for child in children {
            self.walk_compound(child)?;
        }
        let compound = tree.node(id).compound.clone();
        for compound_id in compound {
            let compound_node = tree.node(compound_id);
            let records =
                self.selector
                    .select_compound(compound_node, &self.affected, None)?;
            self.process(compound_id, records)?;
            self.walk_compound(compound_id)?;
        }
        Ok(())
    }

    /// Exclusion rules see the full match map, so they run only after the
    /// whole tree has been resolved, in traversal order.
    fn resolve_exclusions(&self, input: &InputData) -> Result<ExcludedMap> {
        let mut excluded_map = ExcludedMap::new();
        for id in &self.ignore_nodes {
            let node = self.selector.tree.node(*id);
            let base = self.selector.base_filter(node)?;
            let ids = ignore::resolve_node(
                self.selector.store,
                node,
                &base,
                &self.selections[id.0],
                &self.match_map,
                &excluded_map,
                input,
            )?;
            if !ids.is_empty() {
                excluded_map.insert(node.entity.clone(), ids);
            }
        }
        Ok(excluded_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigNode, MatchSource, MatchSpec};
    use crate::store::{SqliteStore, Value};

    fn fixture() -> (SqliteStore, InputData) {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE project (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE station (id INTEGER PRIMARY KEY, project_id INTEGER, name TEXT);
                 CREATE TABLE stop (id INTEGER PRIMARY KEY, project_id INTEGER,
                                    station_id INTEGER, label TEXT);
                 INSERT INTO project VALUES (1, 'origin'), (2, 'target');
                 INSERT INTO station VALUES (1, 1, 'Central'), (2, 1, 'Yard'),
                                            (10, 2, 'Central');
                 INSERT INTO stop VALUES (1, 1, 1, 'a'), (2, 1, 2, 'b');",
            )
            .unwrap();
        let mut input = InputData::new();
        input.insert("project_id".to_string(), Value::Integer(1));
        input.insert("target_project_id".to_string(), Value::Integer(2));
        (store, input)
    }

    fn stop_tree() -> ConfigTree {
        let mut tree = ConfigTree::new();
        let stop = tree.add(ConfigNode::new("stop").field(
            "station_id",
            crate::config::FieldAction::to_existing(
                "station",
                MatchSpec::fields([
                    (
                        "project_id",
                        MatchSource::Input {
                            key: "target_project_id".to_string(),
                        },
                    ),
                    ("name", MatchSource::Origin),
                ]),
            ),
        ));
        tree.add_root(
            ConfigNode::new("project")
                .filter_key("id", "project_id")
                .field(
                    "stops",
                    crate::config::FieldAction::nested(stop, "project_id"),
                ),
        );
        tree
    }

    #[test]
    fn test_tree_without_resolution_fields_yields_empty_maps() {
        let (store, input) = fixture();
        let mut tree = ConfigTree::new();
        tree.add_root(ConfigNode::new("project").filter_key("id", "project_id"));

        let resolution = resolve(&tree, &store, &input).unwrap();
        assert!(resolution.match_map.is_empty());
        assert!(resolution.excluded_map.is_empty());
        assert!(!resolution.has_unmatched());
    }

    #[test]
    fn test_nested_resolution_scopes_by_parent_and_flags_unmatched() {
        let (store, input) = fixture();
        let resolution = resolve(&stop_tree(), &store, &input).unwrap();

        let field_map = &resolution.match_map["stop"]["station_id"];
        assert_eq!(field_map.get("1"), Some(&Some("10".to_string())));
        assert_eq!(field_map.get("2"), Some(&None));
        assert!(resolution.has_unmatched());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let (store, input) = fixture();
        let tree = stop_tree();
        let first = resolve(&tree, &store, &input).unwrap();
        let second = resolve(&tree, &store, &input).unwrap();
        assert_eq!(first, second);
    }
}
