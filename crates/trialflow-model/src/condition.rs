//! Rule and condition shapes produced by the editing layer.
//!
//! A step holds zero or more conditions (OR between them, first match wins);
//! each condition holds one or more rules (AND between them).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel destination that ends the experiment instead of naming a step.
pub const FINISH_EXPERIMENT: &str = "FINISH_EXPERIMENT";

/// Comparison operator of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Operator {
    #[default]
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "==",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
        };
        f.write_str(s)
    }
}

/// Which component list of a dynamically-composed step a rule or key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Components,
    ResponseComponents,
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "components" => Some(FieldType::Components),
            "response_components" => Some(FieldType::ResponseComponents),
            _ => None,
        }
    }

    /// Parameter name of the component array in the step configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Components => "components",
            FieldType::ResponseComponents => "response_components",
        }
    }

    /// Field name under which the host reports this list in collected data.
    pub fn data_field(&self) -> &'static str {
        match self {
            FieldType::Components => "components",
            FieldType::ResponseComponents => "response",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single comparison against collected data.
///
/// Plain rules set only `prop`. Rules on a dynamically-composed step also set
/// `field_type` and `component_idx`; for survey components `prop` is the
/// question name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_idx: Option<String>,
    #[serde(default)]
    pub prop: String,
    #[serde(default)]
    pub op: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Rule {
    pub fn simple(prop: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field_type: None,
            component_idx: None,
            prop: prop.into(),
            op,
            value: value.into(),
        }
    }

    pub fn component(
        field_type: FieldType,
        component_idx: impl Into<String>,
        prop: impl Into<String>,
        op: Operator,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            field_type: Some(field_type),
            component_idx: Some(component_idx.into()),
            prop: prop.into(),
            op,
            value: value.into(),
        }
    }

    /// `false` when the rule names no property (or names a field type without a
    /// component); such a rule can never match.
    pub fn is_addressed(&self) -> bool {
        if self.prop.trim().is_empty() {
            return false;
        }
        match self.field_type {
            Some(_) => self
                .component_idx
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty()),
            None => true,
        }
    }
}

/// A rule that reads data collected by another step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsOverrideRule {
    #[serde(default)]
    pub trial_id: String,
    #[serde(flatten)]
    pub rule: Rule,
}

impl ParamsOverrideRule {
    pub fn new(trial_id: impl Into<String>, rule: Rule) -> Self {
        Self {
            trial_id: trial_id.into(),
            rule,
        }
    }

    pub fn is_addressed(&self) -> bool {
        !self.trial_id.trim().is_empty() && self.rule.is_addressed()
    }
}

/// Where an override value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// Literal fixed when the experiment is compiled.
    Typed,
    /// Column of the dataset row bound to the step when it launches.
    Csv,
    /// Keep the plugin default.
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMappingEntry {
    #[serde(default)]
    pub source: ValueSource,
    #[serde(default)]
    pub value: Value,
}

impl ColumnMappingEntry {
    pub fn typed(value: impl Into<Value>) -> Self {
        Self {
            source: ValueSource::Typed,
            value: value.into(),
        }
    }

    pub fn csv(column: impl Into<String>) -> Self {
        Self {
            source: ValueSource::Csv,
            value: Value::String(column.into()),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Branch or jump condition attached to a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCondition {
    #[serde(default, with = "crate::id_serde")]
    pub id: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub next_trial_id: Option<String>,
    #[serde(default)]
    pub custom_parameters: BTreeMap<String, ColumnMappingEntry>,
}

impl BranchCondition {
    pub fn finishes_experiment(&self) -> bool {
        self.next_trial_id.as_deref() == Some(FINISH_EXPERIMENT)
    }
}

/// Condition that restarts the run at `jump_to_trial_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatCondition {
    #[serde(default, with = "crate::id_serde")]
    pub id: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub jump_to_trial_id: Option<String>,
}

/// Condition that rewrites the launch parameters of the step it is attached to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsOverrideCondition {
    #[serde(default, with = "crate::id_serde")]
    pub id: String,
    #[serde(default)]
    pub rules: Vec<ParamsOverrideRule>,
    #[serde(default)]
    pub params_to_override: BTreeMap<String, ColumnMappingEntry>,
}
