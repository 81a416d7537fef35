//! Serializable authoring model for Trialflow experiments.
//!
//! The editing layer produces an [`Experiment`]: an ordered timeline of
//! [`Step`]s, each a [`Trial`] or a [`LoopStep`], carrying branch, repeat and
//! parameter-override conditions. Nothing here evaluates rules; the compiler
//! crate turns this model into executable step programs.
//!
//! # Example
//! ```
//! let json = r#"{ "name": "demo", "timeline": [ { "type": "trial", "id": "intro" } ] }"#;
//! let experiment = trialflow_model::Experiment::from_json(json).unwrap();
//! assert_eq!(experiment.timeline.len(), 1);
//! ```

pub mod condition;
mod id_serde;
pub mod param_key;
pub mod step;

use std::path::Path;

use serde::{Deserialize, Serialize};
use trialflow_types::{Result, TrialflowError};

pub use condition::*;
pub use param_key::{KeyParts, ParamKey, KEY_SEPARATOR, SURVEY_JSON_SEGMENT};
pub use step::{CsvRow, LoopStep, Step, Trial};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub timeline: Vec<Step>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, timeline: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            timeline,
        }
    }

    /// Parse an experiment document.
    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|e| {
            TrialflowError::DocumentError(format!(
                "line {}, column {}: {e}",
                e.line(),
                e.column()
            ))
        })
    }

    /// Read and parse an experiment document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let experiment = Self::from_json(&source)?;
        tracing::debug!(
            path = %path.display(),
            steps = experiment.timeline.len(),
            "Experiment loaded"
        );
        Ok(experiment)
    }

    /// Every trial in timeline order, including those nested in loops.
    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.timeline.iter().flat_map(|step| match step {
            Step::Trial(t) => std::slice::from_ref(t),
            Step::Loop(l) => l.trials.as_slice(),
        })
    }
}
