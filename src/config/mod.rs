// src/config/mod.rs

//! Declarative copy configuration.
//!
//! A [`ConfigTree`] describes which entity types to copy, how each
//! destination field is produced, which references must be reconciled
//! against pre-existing destination records, and which origin records are
//! excluded. Nodes live in an arena and reference each other by [`NodeId`],
//! which keeps traversal-order checks and double-use detection simple.
//!
//! Custom behavior (matching, exclusion, data preparation, post-copy work)
//! is injected as callbacks receiving explicit context structs, so the
//! declarative and programmatic forms dispatch through the same tagged
//! variants.

pub mod validator;

pub use validator::validate;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::request::{ExcludedMap, FieldMatchMap, IdMap, InputData, MatchMap};
use crate::store::{FieldValues, Filter, Record, Store};

/// Arena index of a configuration node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// How one destination field of a copied record is produced.
#[derive(Clone)]
pub enum FieldAction {
    /// Destination field = the origin record's same field.
    CopyFromOrigin,
    /// Destination field = the input parameter named `key`.
    CopyFromInput { key: String },
    /// Recursively copy child records for this relation. The freshly
    /// created parent id is injected into the child's `foreign_key` column;
    /// the child node does not declare that column itself.
    CreateNested { child: NodeId, foreign_key: String },
    /// Destination field = the id-map entry for `entity` at the origin
    /// reference. The referenced entity type must complete creation earlier
    /// in traversal order.
    ResolveToCopied { entity: String },
    /// Destination field = the set-to-filter map entry for this node/field
    /// at the origin reference; null when the match is absent.
    ResolveToExisting { entity: String, match_spec: MatchSpec },
}

impl FieldAction {
    pub fn from_input(key: impl Into<String>) -> Self {
        FieldAction::CopyFromInput { key: key.into() }
    }

    pub fn nested(child: NodeId, foreign_key: impl Into<String>) -> Self {
        FieldAction::CreateNested {
            child,
            foreign_key: foreign_key.into(),
        }
    }

    pub fn to_copied(entity: impl Into<String>) -> Self {
        FieldAction::ResolveToCopied {
            entity: entity.into(),
        }
    }

    pub fn to_existing(entity: impl Into<String>, match_spec: MatchSpec) -> Self {
        FieldAction::ResolveToExisting {
            entity: entity.into(),
            match_spec,
        }
    }
}

impl fmt::Debug for FieldAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldAction::CopyFromOrigin => write!(f, "CopyFromOrigin"),
            FieldAction::CopyFromInput { key } => write!(f, "CopyFromInput({key})"),
            FieldAction::CreateNested { child, foreign_key } => {
                write!(f, "CreateNested({child:?}, fk={foreign_key})")
            }
            FieldAction::ResolveToCopied { entity } => write!(f, "ResolveToCopied({entity})"),
            FieldAction::ResolveToExisting { entity, .. } => {
                write!(f, "ResolveToExisting({entity})")
            }
        }
    }
}

/// Where a declarative match filter takes its value from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSource {
    /// The input parameter named `key`.
    Input { key: String },
    /// The referenced origin record's attribute of the same name.
    Origin,
}

/// Context handed to a custom match function, once per node/field.
pub struct MatchContext<'a> {
    pub node: &'a ConfigNode,
    pub field: &'a str,
    pub input: &'a InputData,
    /// The node's selected origin records.
    pub records: &'a [Record],
    /// The distinct origin records referenced through `field`.
    pub referenced: &'a [Record],
}

/// Custom matcher: returns the full origin-reference-id to
/// destination-id-or-absent mapping for one node/field.
pub type MatchFn =
    Arc<dyn Fn(&MatchContext<'_>, &dyn Store) -> Result<FieldMatchMap> + Send + Sync>;

/// How `ResolveToExisting` finds the destination counterpart of an origin
/// reference.
#[derive(Clone)]
pub enum MatchSpec {
    /// Destination filter field -> value source. Each referenced origin
    /// record matches the destination record satisfying every filter;
    /// zero or multiple candidates resolve to absent.
    Fields(BTreeMap<String, MatchSource>),
    Custom(MatchFn),
}

impl MatchSpec {
    pub fn fields<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, MatchSource)>,
        K: Into<String>,
    {
        MatchSpec::Fields(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }
}

impl fmt::Debug for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchSpec::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
            MatchSpec::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Declarative exclusion condition: exclude this node's origin records that
/// hit `filter_field` when filtered by the origin ids left unmatched in
/// `MatchMap[match_entity][match_field]`. The owning entity type need not
/// be this node's own entity, which lets an ancestor declare an exclusion
/// for a mismatch that occurred in a descendant's field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreCondition {
    pub filter_field: String,
    pub match_entity: String,
    pub match_field: String,
}

impl IgnoreCondition {
    pub fn new(
        filter_field: impl Into<String>,
        match_entity: impl Into<String>,
        match_field: impl Into<String>,
    ) -> Self {
        Self {
            filter_field: filter_field.into(),
            match_entity: match_entity.into(),
            match_field: match_field.into(),
        }
    }
}

/// Context handed to a custom exclusion function.
pub struct IgnoreContext<'a> {
    pub node: &'a ConfigNode,
    pub match_map: &'a MatchMap,
    /// Exclusions computed for previously visited nodes.
    pub excluded: &'a ExcludedMap,
    /// The node's selected origin records (scope already applied).
    pub records: &'a [Record],
    pub input: &'a InputData,
}

/// Custom exclusion: returns the concrete origin records to exclude.
pub type IgnoreFn =
    Arc<dyn Fn(&IgnoreContext<'_>, &dyn Store) -> Result<Vec<Record>> + Send + Sync>;

/// Which origin records of a node are excluded from copying.
#[derive(Clone)]
pub enum ExclusionRule {
    /// Union of the declarative conditions.
    Conditions(Vec<IgnoreCondition>),
    Custom(IgnoreFn),
}

impl fmt::Debug for ExclusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionRule::Conditions(c) => f.debug_tuple("Conditions").field(c).finish(),
            ExclusionRule::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A record created at a node during one run, surfaced to post-copy steps.
#[derive(Debug, Clone)]
pub struct CreatedRecord {
    pub origin: Record,
    pub values: FieldValues,
    pub new_id: String,
}

/// Context handed to a custom preparation or post-copy step.
pub struct StepContext<'a> {
    pub node: &'a ConfigNode,
    pub input: &'a InputData,
    pub match_map: &'a MatchMap,
    /// Id map built so far (empty during preparation of the direct tree).
    pub id_map: &'a IdMap,
    /// Records created at this node; `None` for preparation steps.
    pub created: Option<&'a [CreatedRecord]>,
}

pub type StepFn = Arc<dyn Fn(&StepContext<'_>, &dyn Store) -> Result<()> + Send + Sync>;

/// A side-effect step run before or after creation at a node.
#[derive(Clone)]
pub enum Step {
    /// Delete destination records of this node's entity matching the
    /// input-derived filter (filter field -> input key).
    DeleteByFilter(BTreeMap<String, String>),
    Run(StepFn),
}

impl Step {
    pub fn delete_by_filter<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Step::DeleteByFilter(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn run(f: StepFn) -> Self {
        Step::Run(f)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::DeleteByFilter(m) => f.debug_tuple("DeleteByFilter").field(m).finish(),
            Step::Run(_) => write!(f, "Run(..)"),
        }
    }
}

/// One entity type's position in the configuration tree.
#[derive(Debug, Clone)]
pub struct ConfigNode {
    /// Entity type this node copies. Unique across the whole tree.
    pub entity: String,
    /// Origin selection for root nodes: entity filter field -> input key.
    pub filter_keys: BTreeMap<String, String>,
    /// Destination field -> how its value is produced.
    pub fields: BTreeMap<String, FieldAction>,
    /// Nodes created only after this node's direct subtree completes,
    /// used to reference multiple already-copied parents.
    pub compound: Vec<NodeId>,
    pub exclusion: Option<ExclusionRule>,
    /// Static predicate restricting which origin records are considered.
    pub static_filter: Option<Filter>,
    pub prepare_steps: Vec<Step>,
    pub post_steps: Vec<Step>,
}

impl ConfigNode {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter_keys: BTreeMap::new(),
            fields: BTreeMap::new(),
            compound: Vec::new(),
            exclusion: None,
            static_filter: None,
            prepare_steps: Vec::new(),
            post_steps: Vec::new(),
        }
    }

    pub fn filter_key(mut self, field: impl Into<String>, input_key: impl Into<String>) -> Self {
        self.filter_keys.insert(field.into(), input_key.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, action: FieldAction) -> Self {
        self.fields.insert(name.into(), action);
        self
    }

    pub fn compound_node(mut self, node: NodeId) -> Self {
        self.compound.push(node);
        self
    }

    pub fn exclusion(mut self, rule: ExclusionRule) -> Self {
        self.exclusion = Some(rule);
        self
    }

    pub fn static_filter(mut self, filter: Filter) -> Self {
        self.static_filter = Some(filter);
        self
    }

    pub fn prepare_step(mut self, step: Step) -> Self {
        self.prepare_steps.push(step);
        self
    }

    pub fn post_step(mut self, step: Step) -> Self {
        self.post_steps.push(step);
        self
    }

    /// Nested child relations in deterministic (field name) order.
    pub fn nested_children(&self) -> impl Iterator<Item = (&str, NodeId, &str)> {
        self.fields.iter().filter_map(|(name, action)| match action {
            FieldAction::CreateNested { child, foreign_key } => {
                Some((name.as_str(), *child, foreign_key.as_str()))
            }
            _ => None,
        })
    }
}

/// The configuration arena: every node of every tree in one vector, with
/// the independent tree roots listed in execution order.
#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
    nodes: Vec<ConfigNode>,
    roots: Vec<NodeId>,
}

impl ConfigTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a non-root node, returning its id for use in `CreateNested`
    /// actions or compound lists of a later node.
    pub fn add(&mut self, node: ConfigNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Add a root node. Roots execute in insertion order.
    pub fn add_root(&mut self, node: ConfigNode) -> NodeId {
        let id = self.add(node);
        self.roots.push(id);
        id
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> &ConfigNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in creation order: depth-first pre-order over nested
    /// children, with each node's compound nodes after its direct subtree.
    ///
    /// Fails when a node id is out of bounds or a node is referenced from
    /// more than one place (the arena must form a forest, not a DAG).
    pub fn creation_order(&self) -> Result<Vec<NodeId>> {
        let mut order = Vec::new();
        let mut seen = vec![false; self.nodes.len()];
        for root in &self.roots {
            self.visit(*root, &mut order, &mut seen)?;
        }
        Ok(order)
    }

    fn visit(&self, id: NodeId, order: &mut Vec<NodeId>, seen: &mut [bool]) -> Result<()> {
        let node = self.nodes.get(id.0).ok_or_else(|| {
            Error::Configuration(format!("node id {} is out of bounds", id.0))
        })?;
        if seen[id.0] {
            return Err(Error::Configuration(format!(
                "node for {} is referenced from more than one place in the tree",
                node.entity
            )));
        }
        seen[id.0] = true;
        order.push(id);
        for (_, child, _) in node.nested_children() {
            self.visit(child, order, seen)?;
        }
        for compound in &node.compound {
            self.visit(*compound, order, seen)?;
        }
        Ok(())
    }

    /// All nodes in the order the write phases create them: every root's
    /// direct subtree first, then the compound pass over all roots. This
    /// differs from [`creation_order`](Self::creation_order) on multi-root
    /// trees, where a compound node runs only after the direct trees of
    /// ALL roots.
    pub fn execution_order(&self) -> Result<Vec<NodeId>> {
        // Bounds and double-use are checked by the creation-order walk.
        self.creation_order()?;
        let mut order = Vec::new();
        for root in &self.roots {
            order.extend(self.direct_order(*root));
        }
        for root in &self.roots {
            self.compound_order(*root, &mut order);
        }
        Ok(order)
    }

    fn compound_order(&self, id: NodeId, order: &mut Vec<NodeId>) {
        let node = self.node(id);
        for (_, child, _) in node.nested_children() {
            self.compound_order(child, order);
        }
        for compound in &node.compound {
            order.extend(self.direct_order(*compound));
            self.compound_order(*compound, order);
        }
    }

    /// Whether `id` roots a compound subtree (directly listed in some
    /// node's compound set).
    pub fn is_compound(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|n| n.compound.contains(&id))
    }

    /// Pre-order over nested children only, starting at `from`. Compound
    /// subtrees are not entered; they run their own direct order when the
    /// compound phase reaches them.
    pub fn direct_order(&self, from: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            order.push(id);
            let children: Vec<NodeId> =
                self.node(id).nested_children().map(|(_, c, _)| c).collect();
            for child in children.into_iter().rev() {
                stack.push(child);
            }
        }
        order
    }
}
