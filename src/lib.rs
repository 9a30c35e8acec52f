// src/lib.rs

//! Graft Copy Engine
//!
//! Configuration-driven copying of hierarchical record graphs.
//!
//! Graft copies a tree of related records from one context (a tenant, a
//! project, a parent entity) into a new set of records, following a
//! declarative configuration tree. While copying it rewires references:
//! links between freshly created records are resolved through an id map,
//! and references that must point at pre-existing destination records are
//! matched deterministically ("set to filter"). Ambiguous matches are
//! never guessed: a dry run surfaces them as serializable diagnostic maps,
//! the caller reviews, and a confirmed retry with the same maps proceeds
//! only if the underlying data has not changed in the meantime.
//!
//! # Architecture
//!
//! - Store adapter: all reads and writes go through the [`Store`] trait;
//!   a rusqlite reference implementation is included
//! - Arena configuration tree: nodes reference each other by index, which
//!   keeps ordering checks and double-use detection trivial
//! - Phase state machine: validate, resolve, reconcile, decide, then the
//!   write phases inside one store transaction, all-or-nothing at
//!   whole-request granularity

pub mod config;
pub mod engine;
mod error;
pub mod request;
pub mod resolve;
pub mod store;

pub use config::{
    ConfigNode, ConfigTree, CreatedRecord, ExclusionRule, FieldAction, IgnoreCondition,
    IgnoreContext, MatchContext, MatchSource, MatchSpec, NodeId, Step, StepContext, validate,
};
pub use engine::CopyEngine;
pub use error::{Error, Result};
pub use request::{
    CopyRequest, CopyResult, ExcludedMap, FieldMatchMap, IdMap, InputData, MatchMap, Outcome,
};
pub use resolve::{Resolution, resolve};
pub use store::{Clause, FieldValues, Filter, Record, SqliteStore, Store, Value};
