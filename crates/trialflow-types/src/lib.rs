//! Shared types and errors for the Trialflow rule compiler.
//!
//! This crate provides the foundational types used across the other Trialflow crates:
//! - `TrialflowError`: unified error taxonomy
//! - `DataRecord`: the data a host runtime collects when a step finishes
//! - `DataLog`: every record collected so far in a session, queryable by step id

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unified error type for all Trialflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum TrialflowError {
    // === Document Errors ===
    #[error("Experiment document error: {0}")]
    DocumentError(String),

    #[error("Duplicate step id '{id}'")]
    DuplicateStep { id: String },

    #[error("Unknown step '{id}'")]
    UnknownStep { id: String },

    #[error("Malformed parameter key '{key}': expected 1, 3 or 4 '::'-separated segments, got {segments}")]
    InvalidParamKey { key: String, segments: usize },

    // === Compile Errors ===
    #[error("Experiment validation failed: {0}")]
    ValidationError(String),

    // === Run Errors ===
    #[error("Experiment aborted at step '{step}': {reason}")]
    ExperimentAborted { step: String, reason: String },

    #[error("Step '{step}' failed in host runtime: {message}")]
    StepFailed { step: String, message: String },

    #[error("Step budget exhausted after {steps} steps")]
    StepBudgetExhausted { steps: usize },

    #[error("Restart budget exhausted after {restarts} restarts")]
    RestartBudgetExhausted { restarts: usize },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TrialflowError {
    /// Returns `true` if the error ends the run and cannot be resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrialflowError::ExperimentAborted { .. }
                | TrialflowError::ValidationError(_)
                | TrialflowError::StepBudgetExhausted { .. }
                | TrialflowError::RestartBudgetExhausted { .. }
        )
    }
}

/// A convenience alias for `Result<T, TrialflowError>`.
pub type Result<T> = std::result::Result<T, TrialflowError>;

// ---------------------------------------------------------------------------
// DataRecord: data collected by the host when a step finishes
// ---------------------------------------------------------------------------

/// Field in which the host runtime reports elapsed session time (milliseconds).
pub const ELAPSED_TIME_FIELD: &str = "time_elapsed";

/// One data record, tagged with the id of the step that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub trial_id: String,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl DataRecord {
    pub fn new(trial_id: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            trial_id: trial_id.into(),
            values,
        }
    }

    /// Build a record from a JSON object. Non-object values yield an empty record.
    pub fn from_json(trial_id: impl Into<String>, value: Value) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(trial_id, values)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Elapsed session time in milliseconds, when the host reported it.
    pub fn elapsed_ms(&self) -> Option<f64> {
        self.values.get(ELAPSED_TIME_FIELD).and_then(Value::as_f64)
    }
}

// ---------------------------------------------------------------------------
// DataLog: everything collected so far in a session
// ---------------------------------------------------------------------------

/// Ordered log of collected records. Later records for the same step shadow
/// earlier ones in [`latest_for`](DataLog::latest_for).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataLog {
    records: Vec<DataRecord>,
}

impl DataLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: DataRecord) {
        self.records.push(record);
    }

    /// Most recent record produced by `trial_id`.
    pub fn latest_for(&self, trial_id: &str) -> Option<&DataRecord> {
        self.records.iter().rev().find(|r| r.trial_id == trial_id)
    }

    /// All records produced by `trial_id`, oldest first.
    pub fn records_for<'a>(&'a self, trial_id: &'a str) -> impl Iterator<Item = &'a DataRecord> {
        self.records.iter().filter(move |r| r.trial_id == trial_id)
    }

    /// Most recent record produced by any step in `trial_ids`.
    pub fn latest_among(&self, trial_ids: &[String]) -> Option<&DataRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| trial_ids.iter().any(|id| *id == r.trial_id))
    }

    pub fn last(&self) -> Option<&DataRecord> {
        self.records.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
