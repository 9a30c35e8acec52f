// src/store/mod.rs

//! Store adapter contract consumed by the copy engine.
//!
//! The engine never talks to a concrete database: it reads, creates, and
//! deletes records of named entity types through the [`Store`] trait, and
//! runs its write phases inside the adapter's transaction scope. A
//! rusqlite-backed reference implementation lives in [`sqlite`].

pub mod filter;
pub mod sqlite;
pub mod value;

pub use filter::{Clause, Filter, id_values};
pub use sqlite::SqliteStore;
pub use value::Value;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Field name to value mapping for record creation.
pub type FieldValues = BTreeMap<String, Value>;

/// A record read from the store: entity type, canonical string id, and the
/// record's fields by name. Foreign keys appear as plain id-bearing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity: String,
    pub id: String,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Fetch a field that the configuration declared, failing with a
    /// configuration error naming the entity when it is missing.
    pub fn require(&self, field: &str) -> Result<&Value> {
        self.fields.get(field).ok_or_else(|| {
            Error::Configuration(format!(
                "field {} was declared in {} config, but not present on record {}",
                field, self.entity, self.id
            ))
        })
    }
}

/// External collaborator executing reads and writes against named entity
/// types.
///
/// `find` must be deterministic for unchanged data: the engine compares
/// resolution output across runs, so adapters must return records in a
/// stable order. Writes between `begin` and `commit` must be atomic; the
/// engine calls `rollback` on any failure during its write phases.
pub trait Store {
    /// All records of `entity` matching `filter`.
    fn find(&self, entity: &str, filter: &Filter) -> Result<Vec<Record>>;

    /// Create a record and return its new canonical id.
    fn create(&self, entity: &str, values: &FieldValues) -> Result<String>;

    /// Delete all records matching `filter`, returning the count removed.
    fn delete_by_filter(&self, entity: &str, filter: &Filter) -> Result<usize>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}
