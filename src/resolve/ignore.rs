// src/resolve/ignore.rs

//! Exclusion resolution ("ignore" conditions).
//!
//! Runs after the set-to-filter pass, once per node carrying an exclusion
//! rule, before any write. Declarative conditions turn the unmatched
//! entries of the match map into a store query against this node's entity;
//! the owning entity of the match-map lookup need not be the node's own,
//! which is how an ancestor can exclude records over a mismatch that
//! occurred in a descendant's field.

use tracing::debug;

use crate::config::{ConfigNode, ExclusionRule, IgnoreContext};
use crate::error::Result;
use crate::request::{ExcludedMap, InputData, MatchMap};
use crate::store::{Filter, Record, Store, id_values};

/// Origin ids of `MatchMap[entity][field]` whose match is absent.
fn unmatched_ids(match_map: &MatchMap, entity: &str, field: &str) -> Vec<String> {
    match_map
        .get(entity)
        .and_then(|fields| fields.get(field))
        .map(|field_map| {
            field_map
                .iter()
                .filter(|(_, matched)| matched.is_none())
                .map(|(id, _)| id.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Compute the origin ids excluded at one node.
///
/// `base` is the node's input-derived filter; `records` is the node's
/// selected record set, which bounds the result (a store hit outside the
/// node's scope is not this node's record to exclude).
pub(crate) fn resolve_node(
    store: &dyn Store,
    node: &ConfigNode,
    base: &Filter,
    records: &[Record],
    match_map: &MatchMap,
    excluded: &ExcludedMap,
    input: &InputData,
) -> Result<Vec<String>> {
    let mut ids: Vec<String> = match node.exclusion.as_ref() {
        Some(ExclusionRule::Conditions(conditions)) => {
            let mut hits = Vec::new();
            for condition in conditions {
                let unmatched =
                    unmatched_ids(match_map, &condition.match_entity, &condition.match_field);
                if unmatched.is_empty() {
                    continue;
                }
                let filter = base
                    .clone()
                    .and_in(condition.filter_field.clone(), id_values(&unmatched));
                for record in store.find(&node.entity, &filter)? {
                    hits.push(record.id);
                }
            }
            let in_scope = |id: &String| records.iter().any(|r| &r.id == id);
            hits.retain(in_scope);
            hits
        }
        Some(ExclusionRule::Custom(ignore_fn)) => {
            let context = IgnoreContext {
                node,
                match_map,
                excluded,
                records,
                input,
            };
            ignore_fn(&context, store)?
                .into_iter()
                .map(|record| record.id)
                .collect()
        }
        None => Vec::new(),
    };

    ids.sort();
    ids.dedup();
    if !ids.is_empty() {
        debug!(entity = %node.entity, excluded = ids.len(), "exclusion rule matched");
    }
    Ok(ids)
}
