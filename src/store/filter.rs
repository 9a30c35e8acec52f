// src/store/filter.rs

//! Minimal filter expression for the store adapter contract.
//!
//! A filter is a conjunction of field/operator/value clauses. That is the
//! whole language: selections that would need OR (compound scopes, unions
//! across ignore conditions) are expressed by the engine as multiple `find`
//! calls merged by record id, so store adapters only ever see AND.

use serde::{Deserialize, Serialize};

use super::value::Value;

/// A single predicate on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Clause {
    /// `field = value`
    Eq { field: String, value: Value },
    /// `field IN values` (empty list matches nothing)
    In { field: String, values: Vec<Value> },
    /// `field NOT IN values` (empty list matches everything)
    NotIn { field: String, values: Vec<Value> },
    /// `field IS NULL`
    IsNull { field: String },
}

impl Clause {
    pub fn field(&self) -> &str {
        match self {
            Clause::Eq { field, .. }
            | Clause::In { field, .. }
            | Clause::NotIn { field, .. }
            | Clause::IsNull { field } => field,
        }
    }
}

/// A conjunction of clauses, applied to one entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    /// The empty filter, matching every record of the entity.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and_eq(field, value)
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::all().and_in(field, values)
    }

    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn and_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::In {
            field: field.into(),
            values,
        });
        self
    }

    pub fn and_not_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::NotIn {
            field: field.into(),
            values,
        });
        self
    }

    pub fn and_is_null(mut self, field: impl Into<String>) -> Self {
        self.clauses.push(Clause::IsNull {
            field: field.into(),
        });
        self
    }

    /// Append every clause of `other` to this filter.
    pub fn and(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }
}

/// Build an id list filter value from canonical string ids.
pub fn id_values(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|id| Value::Text(id.clone())).collect()
}
