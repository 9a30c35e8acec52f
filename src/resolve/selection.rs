// src/resolve/selection.rs

//! Origin-record selection shared by the resolution pass and the create
//! phase.
//!
//! Selection is the one place where both passes must agree exactly: the
//! match map is keyed by references of the records that would be copied,
//! and the round-trip invariant (every selected origin id ends up in the
//! id map) depends on the create phase seeing the same record sets.

use std::collections::BTreeMap;

use crate::config::{ConfigNode, ConfigTree, FieldAction};
use crate::error::{Error, Result};
use crate::request::{ExcludedMap, InputData};
use crate::store::{Filter, Record, Store, id_values};

/// Origin ids already selected (resolution) or copied (creation), per
/// entity type. Drives compound-node scoping.
pub type AffectedMap = BTreeMap<String, Vec<String>>;

pub struct Selector<'a> {
    pub tree: &'a ConfigTree,
    pub store: &'a dyn Store,
    pub input: &'a InputData,
}

impl<'a> Selector<'a> {
    pub fn new(tree: &'a ConfigTree, store: &'a dyn Store, input: &'a InputData) -> Self {
        Self { tree, store, input }
    }

    /// Input-derived filter plus the node's static predicate.
    pub fn base_filter(&self, node: &ConfigNode) -> Result<Filter> {
        let mut filter = Filter::all();
        for (field, key) in &node.filter_keys {
            let value = self.input.get(key).ok_or_else(|| {
                Error::Configuration(format!(
                    "filter {field} on {} was declared, but value for {key} not found in input",
                    node.entity
                ))
            })?;
            filter = filter.and_eq(field.clone(), value.clone());
        }
        if let Some(static_filter) = &node.static_filter {
            filter = filter.and(static_filter.clone());
        }
        Ok(filter)
    }

    fn excluded_filter(filter: Filter, entity: &str, excluded: Option<&ExcludedMap>) -> Filter {
        match excluded.and_then(|map| map.get(entity)) {
            Some(ids) if !ids.is_empty() => filter.and_not_in("id", id_values(ids)),
            _ => filter,
        }
    }

    /// Select a direct node's origin records. `scope` narrows nested
    /// children to their parents' records.
    pub fn select(
        &self,
        node: &ConfigNode,
        scope: Option<&Filter>,
        excluded: Option<&ExcludedMap>,
    ) -> Result<Vec<Record>> {
        let mut filter = self.base_filter(node)?;
        if let Some(scope) = scope {
            filter = filter.and(scope.clone());
        }
        filter = Self::excluded_filter(filter, &node.entity, excluded);
        self.store.find(&node.entity, &filter)
    }

    /// Select a compound node's origin records: those referencing at least
    /// one affected parent through a `ResolveToCopied` field.
    ///
    /// The filter language is AND-only, so the "any referenced field is
    /// affected, the rest are affected or null" shape is computed as a
    /// union of finds over the non-empty subsets of the reference fields,
    /// merged by record id.
    pub fn select_compound(
        &self,
        node: &ConfigNode,
        affected: &AffectedMap,
        excluded: Option<&ExcludedMap>,
    ) -> Result<Vec<Record>> {
        let mut reference_fields: Vec<(&str, &Vec<String>)> = Vec::new();
        for (field, action) in &node.fields {
            let FieldAction::ResolveToCopied { entity } = action else {
                continue;
            };
            // Self-references cannot scope the selection.
            if *entity == node.entity {
                continue;
            }
            if let Some(ids) = affected.get(entity)
                && !ids.is_empty()
            {
                reference_fields.push((field, ids));
            }
        }
        if reference_fields.is_empty() {
            return Ok(Vec::new());
        }

        let base = self.base_filter(node)?;
        let mut merged: BTreeMap<String, Record> = BTreeMap::new();
        for subset in 1u32..(1 << reference_fields.len()) {
            let mut filter = base.clone();
            for (bit, (field, ids)) in reference_fields.iter().enumerate() {
                if subset & (1 << bit) != 0 {
                    filter = filter.and_in(field.to_string(), id_values(ids));
                } else {
                    filter = filter.and_is_null(field.to_string());
                }
            }
            filter = Self::excluded_filter(filter, &node.entity, excluded);
            for record in self.store.find(&node.entity, &filter)? {
                merged.insert(record.id.clone(), record);
            }
        }
        Ok(merged.into_values().collect())
    }
}
