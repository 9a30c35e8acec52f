// tests/common/mod.rs

//! Shared fixtures for copy engine integration tests.
//!
//! The scenario is a small transit network: routes belong to a project and
//! own stops, stops reference stations that pre-exist in both the origin
//! and the target project, and route links connect two routes of the same
//! project. Copying the routes of project 1 into project 2 exercises
//! nested creation, set-to-filter matching, and compound nodes at once.

use std::cell::Cell;

use graft::{
    ConfigNode, ConfigTree, Error, ExclusionRule, FieldAction, FieldValues, Filter,
    IgnoreCondition, InputData, MatchSource, MatchSpec, Record, Result, SqliteStore, Store,
    Value,
};

pub fn seed(store: &SqliteStore) {
    store
        .connection()
        .execute_batch(
            "CREATE TABLE project (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE station (id INTEGER PRIMARY KEY, project_id INTEGER, name TEXT);
             CREATE TABLE route (id INTEGER PRIMARY KEY, project_id INTEGER, name TEXT);
             CREATE TABLE stop (id INTEGER PRIMARY KEY, route_id INTEGER,
                                station_id INTEGER, position INTEGER);
             CREATE TABLE route_link (id INTEGER PRIMARY KEY, project_id INTEGER,
                                      from_route_id INTEGER, to_route_id INTEGER);
             INSERT INTO project VALUES (1, 'origin'), (2, 'target');
             INSERT INTO station VALUES
                 (1, 1, 'Central'), (2, 1, 'Harbor'),
                 (10, 2, 'Central'), (11, 2, 'Harbor');
             INSERT INTO route VALUES (1, 1, 'Red'), (2, 1, 'Blue');
             INSERT INTO stop VALUES (1, 1, 1, 0), (2, 1, 2, 1), (3, 2, 1, 0);
             INSERT INTO route_link VALUES (1, 1, 1, 2);",
        )
        .unwrap();
}

pub fn network_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    seed(&store);
    store
}

pub fn network_input() -> InputData {
    let mut input = InputData::new();
    input.insert("project_id".to_string(), Value::Integer(1));
    input.insert("target_project_id".to_string(), Value::Integer(2));
    input
}

/// Stations are matched by name within the target project.
pub fn station_match() -> MatchSpec {
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

pub fn network_tree() -> ConfigTree {
    build_tree(false)
}

/// Like [`network_tree`], but stops whose station has no counterpart in
/// the target project are excluded instead of copied with a null station.
pub fn network_tree_with_exclusion() -> ConfigTree {
    build_tree(true)
}

fn build_tree(exclude_unmatched_stops: bool) -> ConfigTree {
    let mut tree = ConfigTree::new();

    let mut stop = ConfigNode::new("stop")
        .field("position", FieldAction::CopyFromOrigin)
        .field(
            "station_id",
            FieldAction::to_existing("station", station_match()),
        );
    if exclude_unmatched_stops {
        stop = stop.exclusion(ExclusionRule::Conditions(vec![IgnoreCondition::new(
            "station_id",
            "stop",
            "station_id",
        )]));
    }
    let stop = tree.add(stop);

    let link = tree.add(
        ConfigNode::new("route_link")
            .field("project_id", FieldAction::from_input("target_project_id"))
            .field("from_route_id", FieldAction::to_copied("route"))
            .field("to_route_id", FieldAction::to_copied("route")),
    );

    tree.add_root(
        ConfigNode::new("route")
            .filter_key("project_id", "project_id")
            .field("project_id", FieldAction::from_input("target_project_id"))
            .field("name", FieldAction::CopyFromOrigin)
            .field("stops", FieldAction::nested(stop, "route_id"))
            .compound_node(link),
    );
    tree
}

pub fn count(store: &SqliteStore, entity: &str) -> usize {
    store.find(entity, &Filter::all()).unwrap().len()
}

/// Store wrapper that fails after a fixed number of creates, for
/// atomicity tests.
pub struct FailingStore<'a> {
    inner: &'a SqliteStore,
    remaining_creates: Cell<usize>,
}

impl<'a> FailingStore<'a> {
    pub fn failing_after(inner: &'a SqliteStore, creates: usize) -> Self {
        Self {
            inner,
            remaining_creates: Cell::new(creates),
        }
    }
}

impl Store for FailingStore<'_> {
    fn find(&self, entity: &str, filter: &Filter) -> Result<Vec<Record>> {
        self.inner.find(entity, filter)
    }

    fn create(&self, entity: &str, values: &FieldValues) -> Result<String> {
        if self.remaining_creates.get() == 0 {
            return Err(Error::Store("injected create failure".to_string()));
        }
        self.remaining_creates.set(self.remaining_creates.get() - 1);
        self.inner.create(entity, values)
    }

    fn delete_by_filter(&self, entity: &str, filter: &Filter) -> Result<usize> {
        self.inner.delete_by_filter(entity, filter)
    }

    fn begin(&self) -> Result<()> {
        self.inner.begin()
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }
}
