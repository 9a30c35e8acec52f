// src/resolve/set_to_filter.rs

//! Deterministic matching of origin references against pre-existing
//! destination records.
//!
//! For every `ResolveToExisting` field, each distinct origin record
//! referenced through that field is matched to at most one destination
//! record: declaratively by a filter built from input parameters and the
//! referenced record's own attributes, or through a custom matcher invoked
//! once per node/field with the whole candidate set. Zero or multiple
//! candidates resolve to absent; multiplicity is never guessed. This pass
//! performs no writes.

use tracing::debug;

use crate::config::{ConfigNode, MatchContext, MatchSource, MatchSpec};
use crate::error::{Error, Result};
use crate::request::{FieldMatchMap, InputData};
use crate::store::{Filter, Record, Store, Value, id_values};

/// Distinct, non-null reference ids carried by `field` across `records`,
/// in first-seen order.
fn referenced_ids(records: &[Record], field: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for record in records {
        let value = record.require(field)?;
        if value.is_null() {
            continue;
        }
        let id = value.as_id_string().ok_or_else(|| {
            Error::Configuration(format!(
                "field {field} on {} does not carry a reference id",
                record.entity
            ))
        })?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Build the destination filter for one referenced origin record.
fn match_filter(
    node: &ConfigNode,
    field: &str,
    filters: &std::collections::BTreeMap<String, MatchSource>,
    referenced: &Record,
    input: &InputData,
) -> Result<Filter> {
    let mut filter = Filter::all();
    for (filter_field, source) in filters {
        let value: Value = match source {
            MatchSource::Input { key } => input
                .get(key)
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "match filter {filter_field} on {}.{field} was declared, \
                         but value for {key} not found in input",
                        node.entity
                    ))
                })?
                .clone(),
            MatchSource::Origin => referenced.require(filter_field)?.clone(),
        };
        filter = filter.and_eq(filter_field.clone(), value);
    }
    Ok(filter)
}

/// Resolve one node/field into its origin-reference to destination map.
pub(crate) fn resolve_field(
    store: &dyn Store,
    node: &ConfigNode,
    field: &str,
    entity: &str,
    match_spec: &MatchSpec,
    records: &[Record],
    input: &InputData,
) -> Result<FieldMatchMap> {
    let ids = referenced_ids(records, field)?;
    let referenced = if ids.is_empty() {
        Vec::new()
    } else {
        store.find(entity, &Filter::is_in("id", id_values(&ids)))?
    };

    let map = match match_spec {
        MatchSpec::Fields(filters) => {
            let mut map = FieldMatchMap::new();
            for reference in &referenced {
                let filter = match_filter(node, field, filters, reference, input)?;
                let candidates = store.find(entity, &filter)?;
                let matched = match candidates.as_slice() {
                    [single] => Some(single.id.clone()),
                    _ => None,
                };
                map.insert(reference.id.clone(), matched);
            }
            map
        }
        MatchSpec::Custom(match_fn) => {
            let context = MatchContext {
                node,
                field,
                input,
                records,
                referenced: &referenced,
            };
            match_fn(&context, store)?
        }
    };

    debug!(
        entity = %node.entity,
        field,
        referenced = referenced.len(),
        unmatched = map.values().filter(|v| v.is_none()).count(),
        "set-to-filter field resolved"
    );
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldAction;
    use crate::store::SqliteStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Stops in project 1 reference stations; project 2 has counterpart
    /// stations matched by name. "Depot" exists twice in project 2 and
    /// "Yard" not at all.
    fn fixture() -> (SqliteStore, InputData) {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE station (id INTEGER PRIMARY KEY, project_id INTEGER, name TEXT);
                 CREATE TABLE stop (id INTEGER PRIMARY KEY, project_id INTEGER,
                                    station_id INTEGER);
                 INSERT INTO station VALUES
                     (1, 1, 'Central'), (2, 1, 'Depot'), (3, 1, 'Yard'),
                     (10, 2, 'Central'), (11, 2, 'Depot'), (12, 2, 'Depot');
                 INSERT INTO stop VALUES (1, 1, 1), (2, 1, 2), (3, 1, 3), (4, 1, NULL);",
            )
            .unwrap();
        let mut input = InputData::new();
        input.insert("target_project_id".to_string(), Value::Integer(2));
        (store, input)
    }

    fn stop_records(store: &SqliteStore) -> Vec<Record> {
        store.find("stop", &Filter::eq("project_id", 1)).unwrap()
    }

    fn station_spec() -> MatchSpec {
        MatchSpec::fields([
            (
                "project_id",
                MatchSource::Input {
                    key: "target_project_id".to_string(),
                },
            ),
            ("name", MatchSource::Origin),
        ])
    }

    #[test]
    fn test_declarative_match_resolves_unique_counterparts() {
        let (store, input) = fixture();
        let node = ConfigNode::new("stop").field(
            "station_id",
            FieldAction::to_existing("station", station_spec()),
        );
        let records = stop_records(&store);

        let map = resolve_field(
            &store,
            &node,
            "station_id",
            "station",
            &station_spec(),
            &records,
            &input,
        )
        .unwrap();

        // Central -> unique counterpart, Depot -> two candidates, Yard -> none.
        assert_eq!(map.get("1"), Some(&Some("10".to_string())));
        assert_eq!(map.get("2"), Some(&None));
        assert_eq!(map.get("3"), Some(&None));
        // The null reference on stop 4 contributes no key.
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let (store, input) = fixture();
        let node = ConfigNode::new("stop").field(
            "station_id",
            FieldAction::to_existing("station", station_spec()),
        );
        let records = stop_records(&store);

        let first = resolve_field(
            &store,
            &node,
            "station_id",
            "station",
            &station_spec(),
            &records,
            &input,
        )
        .unwrap();
        let second = resolve_field(
            &store,
            &node,
            "station_id",
            "station",
            &station_spec(),
            &records,
            &input,
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_custom_matcher_receives_candidates_once() {
        let (store, input) = fixture();
        let node = ConfigNode::new("stop");
        let records = stop_records(&store);

        let spec = MatchSpec::Custom(Arc::new(|ctx: &MatchContext<'_>, _store| {
            let mut map = BTreeMap::new();
            for reference in ctx.referenced {
                // Match everything to a fixed station.
                map.insert(reference.id.clone(), Some("10".to_string()));
            }
            Ok(map)
        }));

        let map =
            resolve_field(&store, &node, "station_id", "station", &spec, &records, &input)
                .unwrap();
        assert_eq!(map.len(), 3);
        assert!(map.values().all(|v| v == &Some("10".to_string())));
    }

    #[test]
    fn test_missing_input_key_is_configuration_error() {
        let (store, _) = fixture();
        let node = ConfigNode::new("stop");
        let records = stop_records(&store);
        let empty_input = InputData::new();

        let err = resolve_field(
            &store,
            &node,
            "station_id",
            "station",
            &station_spec(),
            &records,
            &empty_input,
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }
}
