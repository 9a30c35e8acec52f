// src/request.rs

//! Request and result shapes for one copy run.
//!
//! Identifiers are strings end to end so the diagnostic maps survive round
//! trips through an external medium (HTTP, job queues, human review). The
//! maps use BTreeMap so serialization and the reconciliation comparison are
//! deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::Result;
use crate::store::Value;

/// Input parameter mapping driving origin selection and field values.
pub type InputData = BTreeMap<String, Value>;

/// entity type -> (origin id -> newly created id). Populated only for
/// records actually created, append-only within one run.
pub type IdMap = BTreeMap<String, BTreeMap<String, String>>;

/// origin reference id -> matched destination id, or `None` when the match
/// is absent (zero or multiple candidates).
pub type FieldMatchMap = BTreeMap<String, Option<String>>;

/// entity type -> field name -> [`FieldMatchMap`]. Computed once per run by
/// the set-to-filter resolver, immutable thereafter.
pub type MatchMap = BTreeMap<String, BTreeMap<String, FieldMatchMap>>;

/// entity type -> origin ids excluded from copying, sorted.
pub type ExcludedMap = BTreeMap<String, Vec<String>>;

/// Why a run did not copy anything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
pub enum Outcome {
    /// The run succeeded (or has not aborted).
    #[default]
    None,
    /// Exclusion rules matched records; caller must confirm.
    Excluded,
    /// Some set-to-filter reference has no destination match; caller must
    /// confirm.
    Unmatched,
    /// Origin data changed since the diagnostic maps under review were
    /// computed; a fresh dry run is required.
    DataChanged,
    /// The configuration tree was rejected before resolution.
    ValidationError,
}

/// One copy invocation.
///
/// A first call is normally a dry run (`confirm_write = false`). When it
/// aborts with [`Outcome::Excluded`] or [`Outcome::Unmatched`], the caller
/// inspects the returned maps and re-invokes with `confirm_write = true`
/// and the same maps threaded back in, which lets the engine detect stale
/// diagnostics.
#[derive(Debug, Clone, Default)]
pub struct CopyRequest {
    pub input: InputData,
    pub confirm_write: bool,
    pub match_map: Option<MatchMap>,
    pub excluded_map: Option<ExcludedMap>,
}

impl CopyRequest {
    pub fn new(input: InputData) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    /// A confirmed retry carrying the maps from a previous aborted run.
    pub fn confirmed(input: InputData, match_map: MatchMap, excluded_map: ExcludedMap) -> Self {
        Self {
            input,
            confirm_write: true,
            match_map: Some(match_map),
            excluded_map: Some(excluded_map),
        }
    }
}

/// Outcome of one copy run, successful or aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyResult {
    pub is_successful: bool,
    pub outcome: Outcome,
    pub id_map: IdMap,
    pub match_map: MatchMap,
    pub excluded_map: ExcludedMap,
}

impl CopyResult {
    pub fn successful(id_map: IdMap, match_map: MatchMap, excluded_map: ExcludedMap) -> Self {
        Self {
            is_successful: true,
            outcome: Outcome::None,
            id_map,
            match_map,
            excluded_map,
        }
    }

    /// A non-fatal abort carrying the diagnostic maps for review.
    pub fn aborted(outcome: Outcome, match_map: MatchMap, excluded_map: ExcludedMap) -> Self {
        Self {
            is_successful: false,
            outcome,
            id_map: IdMap::new(),
            match_map,
            excluded_map,
        }
    }

    /// A rejected configuration, reported in serializable form for hosts
    /// that cannot propagate the error itself.
    pub fn validation_failure() -> Self {
        Self::aborted(Outcome::ValidationError, MatchMap::new(), ExcludedMap::new())
    }

    /// Wire form for transport to a reviewing caller.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
