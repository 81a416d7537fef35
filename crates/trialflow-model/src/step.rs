use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::{BranchCondition, ParamsOverrideCondition, RepeatCondition};

/// A row of an imported dataset, keyed by column name.
pub type CsvRow = Map<String, Value>;

/// A leaf step: one plugin launch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branch_conditions: Vec<BranchCondition>,
    #[serde(default)]
    pub repeat_conditions: Vec<RepeatCondition>,
    #[serde(default)]
    pub params_override: Vec<ParamsOverrideCondition>,
    #[serde(default)]
    pub csv_columns: Vec<String>,
    #[serde(default)]
    pub csv_rows: Vec<CsvRow>,
}

impl Trial {
    pub fn new(id: impl Into<String>, plugin: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            plugin: plugin.into(),
            ..Default::default()
        }
    }
}

/// A container that runs its trials in order, once per dataset row or
/// `repetitions` times when it has no rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trials: Vec<Trial>,
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branch_conditions: Vec<BranchCondition>,
    #[serde(default)]
    pub csv_columns: Vec<String>,
    #[serde(default)]
    pub csv_rows: Vec<CsvRow>,
}

fn default_repetitions() -> u32 {
    1
}

impl LoopStep {
    pub fn new(id: impl Into<String>, trials: Vec<Trial>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            trials,
            repetitions: 1,
            branches: Vec::new(),
            branch_conditions: Vec::new(),
            csv_columns: Vec::new(),
            csv_rows: Vec::new(),
        }
    }

    /// Number of passes over the child trials.
    pub fn iterations(&self) -> usize {
        if self.csv_rows.is_empty() {
            self.repetitions as usize
        } else {
            self.csv_rows.len()
        }
    }
}

/// Either a trial or a loop in the experiment timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Trial(Trial),
    Loop(LoopStep),
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::Trial(t) => &t.id,
            Step::Loop(l) => &l.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Step::Trial(t) => &t.name,
            Step::Loop(l) => &l.name,
        }
    }

    pub fn branches(&self) -> &[String] {
        match self {
            Step::Trial(t) => &t.branches,
            Step::Loop(l) => &l.branches,
        }
    }

    pub fn branch_conditions(&self) -> &[BranchCondition] {
        match self {
            Step::Trial(t) => &t.branch_conditions,
            Step::Loop(l) => &l.branch_conditions,
        }
    }

    pub fn csv_columns(&self) -> &[String] {
        match self {
            Step::Trial(t) => &t.csv_columns,
            Step::Loop(l) => &l.csv_columns,
        }
    }

    pub fn as_trial(&self) -> Option<&Trial> {
        match self {
            Step::Trial(t) => Some(t),
            Step::Loop(_) => None,
        }
    }

    pub fn as_loop(&self) -> Option<&LoopStep> {
        match self {
            Step::Loop(l) => Some(l),
            Step::Trial(_) => None,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, Step::Loop(_))
    }
}

impl From<Trial> for Step {
    fn from(trial: Trial) -> Self {
        Step::Trial(trial)
    }
}

impl From<LoopStep> for Step {
    fn from(l: LoopStep) -> Self {
        Step::Loop(l)
    }
}
