// src/engine/mod.rs

//! The copy orchestrator.
//!
//! [`CopyEngine`] sequences one request through strictly ordered phases,
//! none re-entered:
//!
//! ```text
//! Validate -> Resolve -> Reconcile -> Decide -> | Prepare -> Create ->
//!                                               | Compound -> Post-copy
//!                                               '-- one store transaction
//! ```
//!
//! Phases up to Decide are read-only and may abort with a recoverable
//! outcome carrying the diagnostic maps. The write phases run inside one
//! store transaction: any store failure rolls back every write of the run,
//! so a failed request leaves the destination context untouched.

use tracing::{debug, info, warn};

use crate::config::{
    ConfigNode, ConfigTree, CreatedRecord, FieldAction, NodeId, Step, StepContext, validate,
};
use crate::error::{Error, Result};
use crate::request::{CopyRequest, CopyResult, IdMap, InputData, Outcome};
use crate::resolve::{AffectedMap, Resolution, Selector, resolve};
use crate::store::{FieldValues, Filter, Record, Store, Value, id_values};

/// Orchestrates copy requests against one configuration tree and store.
pub struct CopyEngine<'a> {
    tree: &'a ConfigTree,
    store: &'a dyn Store,
}

impl<'a> CopyEngine<'a> {
    pub fn new(tree: &'a ConfigTree, store: &'a dyn Store) -> Self {
        Self { tree, store }
    }

    /// Execute one copy request.
    ///
    /// Returns `Ok` with either a successful result or a recoverable abort
    /// (`Excluded`, `Unmatched`, `DataChanged`). Configuration errors and
    /// store failures are returned as `Err`; in the latter case every
    /// write of the run has been rolled back.
    pub fn execute(&self, request: &CopyRequest) -> Result<CopyResult> {
        // Phase 1: validate.
        validate(self.tree, &request.input)?;

        // Phase 2: resolve (read-only).
        let resolution = resolve(self.tree, self.store, &request.input)?;

        // Phase 3: reconcile threaded-back diagnostics against fresh ones.
        let stale = request
            .match_map
            .as_ref()
            .is_some_and(|prior| *prior != resolution.match_map)
            || request
                .excluded_map
                .as_ref()
                .is_some_and(|prior| *prior != resolution.excluded_map);
        if stale {
            info!("origin data changed since reviewed diagnostics were computed");
            return Ok(CopyResult::aborted(
                Outcome::DataChanged,
                resolution.match_map,
                resolution.excluded_map,
            ));
        }

        // Phase 4: decide.
        if !request.confirm_write {
            if !resolution.excluded_map.is_empty() {
                return Ok(CopyResult::aborted(
                    Outcome::Excluded,
                    resolution.match_map,
                    resolution.excluded_map,
                ));
            }
            if resolution.has_unmatched() {
                return Ok(CopyResult::aborted(
                    Outcome::Unmatched,
                    resolution.match_map,
                    resolution.excluded_map,
                ));
            }
        }

        // Phases 5-8 inside one transaction.
        self.store.begin()?;
        let id_map = match self.write_phases(&request.input, &resolution) {
            Ok(id_map) => {
                self.store.commit()?;
                id_map
            }
            Err(e) => {
                if let Err(rollback_err) = self.store.rollback() {
                    warn!("rollback after failed copy also failed: {rollback_err}");
                }
                return Err(e);
            }
        };

        // Phase 9: assemble.
        info!(entities = id_map.len(), "copy request complete");
        Ok(CopyResult::successful(
            id_map,
            resolution.match_map,
            resolution.excluded_map,
        ))
    }

    /// Like [`execute`](Self::execute), but reports configuration errors
    /// as a serializable `ValidationError` result for hosts that cannot
    /// propagate the error value itself.
    pub fn execute_or_report(&self, request: &CopyRequest) -> Result<CopyResult> {
        match self.execute(request) {
            Err(e) if e.is_configuration() => {
                warn!("configuration rejected: {e}");
                Ok(CopyResult::validation_failure())
            }
            other => other,
        }
    }

    fn write_phases(&self, input: &InputData, resolution: &Resolution) -> Result<IdMap> {
        let mut run = Run {
            tree: self.tree,
            selector: Selector::new(self.tree, self.store, input),
            resolution,
            id_map: IdMap::new(),
            affected: AffectedMap::new(),
            created: vec![Vec::new(); self.tree.len()],
        };

        // Phase 5: prepare the direct tree, pre-order. Compound nodes run
        // their preparation when the compound phase reaches them.
        for root in self.tree.roots() {
            for id in self.tree.direct_order(*root) {
                run.run_steps(id, StepKind::Prepare)?;
            }
        }

        // Phase 6: create the direct tree, depth-first pre-order.
        for root in self.tree.roots() {
            run.create_subtree(*root, None, None)?;
        }

        // Phase 7: compound nodes, after the direct subtree they hang off.
        for root in self.tree.roots() {
            run.run_compound(*root)?;
        }

        // Phase 8: post-copy steps for every node, in tree order.
        for id in self.tree.creation_order()? {
            run.run_steps(id, StepKind::Post)?;
        }

        Ok(run.id_map)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum StepKind {
    Prepare,
    Post,
}

/// Mutable state of the write phases for one run.
struct Run<'a> {
    tree: &'a ConfigTree,
    selector: Selector<'a>,
    resolution: &'a Resolution,
    id_map: IdMap,
    /// Origin ids actually copied, per entity; scopes compound selection.
    affected: AffectedMap,
    /// Records created per arena node, surfaced to post-copy steps.
    created: Vec<Vec<CreatedRecord>>,
}

impl Run<'_> {
    fn run_steps(&mut self, id: NodeId, kind: StepKind) -> Result<()> {
        let node = self.tree.node(id);
        let steps = match kind {
            StepKind::Prepare => &node.prepare_steps,
            StepKind::Post => &node.post_steps,
        };
        for step in steps {
            match step {
                Step::DeleteByFilter(filters) => {
                    let mut filter = Filter::all();
                    for (field, key) in filters {
                        let value = self.selector.input.get(key).ok_or_else(|| {
                            Error::Configuration(format!(
                                "delete step on {} references input key {key}, \
                                 but it is not present in input data",
                                node.entity
                            ))
                        })?;
                        filter = filter.and_eq(field.clone(), value.clone());
                    }
                    let count = self.selector.store.delete_by_filter(&node.entity, &filter)?;
                    debug!(entity = %node.entity, count, "delete step");
                }
                Step::Run(step_fn) => {
                    let context = StepContext {
                        node,
                        input: self.selector.input,
                        match_map: &self.resolution.match_map,
                        id_map: &self.id_map,
                        created: match kind {
                            StepKind::Prepare => None,
                            StepKind::Post => Some(&self.created[id.0]),
                        },
                    };
                    step_fn(&context, self.selector.store)?;
                }
            }
        }
        Ok(())
    }

    /// Create a direct node's records, then recurse into nested children
    /// with the new parent ids injected through their foreign keys.
    fn create_subtree(
        &mut self,
        id: NodeId,
        scope: Option<&Filter>,
        inject: Option<(&str, &str)>,
    ) -> Result<()> {
        let node = self.tree.node(id);
        let records =
            self.selector
                .select(node, scope, Some(&self.resolution.excluded_map))?;
        self.create_records(id, &records, inject)?;
        self.create_nested(id, &records)
    }

    fn create_nested(&mut self, id: NodeId, records: &[Record]) -> Result<()> {
        let node = self.tree.node(id);
        let parent_ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let children: Vec<(NodeId, String)> = node
            .nested_children()
            .map(|(_, child, fk)| (child, fk.to_string()))
            .collect();
        for (child, foreign_key) in children {
            let scope = Filter::is_in(foreign_key.clone(), id_values(&parent_ids));
            self.create_subtree(child, Some(&scope), Some((&foreign_key, &node.entity)))?;
        }
        Ok(())
    }

    fn create_records(
        &mut self,
        id: NodeId,
        records: &[Record],
        inject: Option<(&str, &str)>,
    ) -> Result<()> {
        let node = self.tree.node(id);
        debug!(entity = %node.entity, records = records.len(), "creating records");

        for record in records {
            let mut values = self.evaluate_fields(node, record)?;
            if let Some((foreign_key, parent_entity)) = inject {
                let new_parent_id = self.copied_id(parent_entity, record, foreign_key)?;
                values.insert(foreign_key.to_string(), new_parent_id);
            }
            let new_id = self.selector.store.create(&node.entity, &values)?;

            self.id_map
                .entry(node.entity.clone())
                .or_default()
                .insert(record.id.clone(), new_id.clone());
            self.affected
                .entry(node.entity.clone())
                .or_default()
                .push(record.id.clone());
            self.created[id.0].push(CreatedRecord {
                origin: record.clone(),
                values,
                new_id,
            });
        }
        Ok(())
    }

    fn evaluate_fields(&self, node: &ConfigNode, record: &Record) -> Result<FieldValues> {
        let mut values = FieldValues::new();
        for (field, action) in &node.fields {
            match action {
                FieldAction::CopyFromOrigin => {
                    values.insert(field.clone(), record.require(field)?.clone());
                }
                FieldAction::CopyFromInput { key } => {
                    let value = self.selector.input.get(key).ok_or_else(|| {
                        Error::Configuration(format!("no {key} in input data"))
                    })?;
                    values.insert(field.clone(), value.clone());
                }
                FieldAction::CreateNested { .. } => {
                    // Child records are created after this one; nothing to
                    // assign on the parent.
                }
                FieldAction::ResolveToCopied { entity } => {
                    let value = record.require(field)?;
                    let resolved = if value.is_null() {
                        Value::Null
                    } else {
                        self.copied_id(entity, record, field)?
                    };
                    values.insert(field.clone(), resolved);
                }
                FieldAction::ResolveToExisting { .. } => {
                    let value = record.require(field)?;
                    let resolved = if value.is_null() {
                        Value::Null
                    } else {
                        self.matched_id(node, field, value)?
                    };
                    values.insert(field.clone(), resolved);
                }
            }
        }
        Ok(values)
    }

    /// Id-map lookup for a reference to an already-copied record.
    fn copied_id(&self, entity: &str, record: &Record, field: &str) -> Result<Value> {
        let origin_ref = record
            .require(field)?
            .as_id_string()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "field {field} on {} does not carry a reference id",
                    record.entity
                ))
            })?;
        let new_id = self
            .id_map
            .get(entity)
            .and_then(|m| m.get(&origin_ref))
            .ok_or_else(|| {
                Error::Resolution(format!(
                    "copy of {entity} with id {origin_ref} was not found in id map"
                ))
            })?;
        Ok(Value::Text(new_id.clone()))
    }

    /// Match-map lookup for a reference reconciled against pre-existing
    /// destination records. An absent match leaves the field unset on the
    /// new record.
    fn matched_id(&self, node: &ConfigNode, field: &str, value: &Value) -> Result<Value> {
        let origin_ref = value.as_id_string().ok_or_else(|| {
            Error::Configuration(format!(
                "field {field} on {} does not carry a reference id",
                node.entity
            ))
        })?;
        let entry = self
            .resolution
            .match_map
            .get(&node.entity)
            .and_then(|fields| fields.get(field))
            .and_then(|field_map| field_map.get(&origin_ref))
            .ok_or_else(|| {
                Error::Resolution(format!(
                    "no match entry for {}.{field} reference {origin_ref}",
                    node.entity
                ))
            })?;
        Ok(match entry {
            Some(destination_id) => Value::Text(destination_id.clone()),
            None => Value::Null,
        })
    }

    /// Compound phase: walk the direct tree and execute each node's
    /// compound configurations after its direct subtree has completed.
    fn run_compound(&mut self, id: NodeId) -> Result<()> {
        let node = self.tree.node(id);
        let children: Vec<NodeId> = node.nested_children().map(|(_, c, _)| c).collect();
        for child in children {
            self.run_compound(child)?;
        }
        let compound = self.tree.node(id).compound.clone();
        for compound_id in compound {
            self.execute_compound_tree(compound_id)?;
        }
        Ok(())
    }

    /// Re-enter prepare and create for one compound subtree.
    fn execute_compound_tree(&mut self, id: NodeId) -> Result<()> {
        for direct in self.tree.direct_order(id) {
            self.run_steps(direct, StepKind::Prepare)?;
        }

        let node = self.tree.node(id);
        let records = self.selector.select_compound(
            node,
            &self.affected,
            Some(&self.resolution.excluded_map),
        )?;
        self.create_records(id, &records, None)?;
        self.create_nested(id, &records)?;

        self.run_compound(id)
    }
}
