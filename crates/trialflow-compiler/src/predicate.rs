//! Predicate AST and evaluator.
//!
//! A condition compiles to a [`Predicate`]: the AND of its [`CompiledRule`]s.
//! Evaluation never fails. Anything that cannot be resolved (missing record,
//! missing field, unknown component, type mismatch) makes the rule false.
//!
//! Comparison semantics:
//! ```text
//! array value      ==  contains, != does not contain, anything else false
//! both numeric     numeric comparison for all six operators
//! otherwise        == / != compare loosely (text form), ordering is false
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trialflow_model::{FieldType, Operator, ParamsOverrideRule, Rule, Trial};
use trialflow_types::{DataLog, DataRecord};

/// `type` of a component whose answers live in a nested `response` object.
pub const SURVEY_COMPONENT_TYPE: &str = "SurveyComponent";

/// Where a rule reads its data record from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DataSource {
    /// The record the current step just produced.
    Current,
    /// The latest record already collected for another step.
    Step { trial_id: String },
}

/// How a value is located inside a data record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "lookup", rename_all = "snake_case")]
pub enum Lookup {
    Field {
        prop: String,
    },
    Component {
        field_type: FieldType,
        component: String,
        prop: String,
    },
    SurveyAnswer {
        field_type: FieldType,
        component: String,
        question: String,
    },
}

impl Lookup {
    pub fn resolve<'a>(&self, values: &'a Map<String, Value>) -> Option<&'a Value> {
        match self {
            Lookup::Field { prop } => values.get(prop),
            Lookup::Component {
                field_type,
                component,
                prop,
            } => {
                let element = find_component(values.get(field_type.data_field())?, component)?;
                // Survey answers are nested even when the step did not declare the type.
                if is_survey(element) {
                    element.get("response")?.get(prop)
                } else {
                    element.get(prop)
                }
            }
            Lookup::SurveyAnswer {
                field_type,
                component,
                question,
            } => {
                let element = find_component(values.get(field_type.data_field())?, component)?;
                element.get("response")?.as_object()?.get(question)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompiledRule {
    /// A rule with no property or source step. Always false.
    Never,
    Compare {
        source: DataSource,
        lookup: Lookup,
        op: Operator,
        expected: Value,
    },
}

impl CompiledRule {
    /// Compile a rule reading `source`. `owners` are the trials whose
    /// parameters may declare the addressed component; a survey declaration
    /// in any of them makes the rule read the nested answer.
    pub fn compile(rule: &Rule, source: DataSource, owners: &[Trial]) -> Self {
        if !rule.is_addressed() {
            return CompiledRule::Never;
        }
        let lookup = match (rule.field_type, rule.component_idx.as_deref()) {
            (Some(field_type), Some(component)) => {
                if owners.iter().any(|t| declares_survey(t, field_type, component)) {
                    Lookup::SurveyAnswer {
                        field_type,
                        component: component.to_string(),
                        question: rule.prop.clone(),
                    }
                } else {
                    Lookup::Component {
                        field_type,
                        component: component.to_string(),
                        prop: rule.prop.clone(),
                    }
                }
            }
            _ => Lookup::Field {
                prop: rule.prop.clone(),
            },
        };
        CompiledRule::Compare {
            source,
            lookup,
            op: rule.op,
            expected: rule.value.clone(),
        }
    }

    pub fn evaluate(&self, current: Option<&DataRecord>, log: &DataLog) -> bool {
        match self {
            CompiledRule::Never => false,
            CompiledRule::Compare {
                source,
                lookup,
                op,
                expected,
            } => {
                let record = match source {
                    DataSource::Current => current,
                    DataSource::Step { trial_id } => log.latest_for(trial_id),
                };
                let Some(record) = record else {
                    return false;
                };
                match lookup.resolve(&record.values) {
                    Some(actual) => compare(actual, *op, expected),
                    None => false,
                }
            }
        }
    }
}

/// AND of rules. An empty predicate is true.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub rules: Vec<CompiledRule>,
}

impl Predicate {
    /// Rules that read the current step's own record.
    pub fn from_rules(rules: &[Rule], owners: &[Trial]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| CompiledRule::compile(r, DataSource::Current, owners))
                .collect(),
        }
    }

    /// Rules that read other steps' records. `owner_of` finds the source step.
    pub fn from_override_rules<'a>(
        rules: &[ParamsOverrideRule],
        owner_of: impl Fn(&str) -> Option<&'a Trial>,
    ) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| {
                    if !r.is_addressed() {
                        return CompiledRule::Never;
                    }
                    let source = DataSource::Step {
                        trial_id: r.trial_id.clone(),
                    };
                    let owners = owner_of(&r.trial_id).map(std::slice::from_ref).unwrap_or_default();
                    CompiledRule::compile(&r.rule, source, owners)
                })
                .collect(),
        }
    }

    pub fn evaluate(&self, current: Option<&DataRecord>, log: &DataLog) -> bool {
        self.rules.iter().all(|r| r.evaluate(current, log))
    }
}

/// Compare a collected value against a rule's expected value.
pub fn compare(actual: &Value, op: Operator, expected: &Value) -> bool {
    if let Value::Array(items) = actual {
        let contains = items.iter().any(|item| loosely_equal(item, expected));
        return match op {
            Operator::Eq => contains,
            Operator::NotEq => !contains,
            _ => false,
        };
    }

    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => match op {
            Operator::Eq => a == b,
            Operator::NotEq => a != b,
            Operator::Gt => a > b,
            Operator::Lt => a < b,
            Operator::Gte => a >= b,
            Operator::Lte => a <= b,
        },
        _ => match op {
            Operator::Eq => loosely_equal(actual, expected),
            Operator::NotEq => !loosely_equal(actual, expected),
            _ => false,
        },
    }
}

/// Numeric reading of a value: JSON numbers, or strings that are entirely a
/// finite decimal number.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        _ => None,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (as_text(a), as_text(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_survey(element: &Value) -> bool {
    element.get("type").and_then(Value::as_str) == Some(SURVEY_COMPONENT_TYPE)
}

/// Element of a component array whose `name` is `name`.
pub(crate) fn find_component<'a>(list: &'a Value, name: &str) -> Option<&'a Value> {
    list.as_array()?
        .iter()
        .find(|c| c.get("name").and_then(Value::as_str) == Some(name))
}

pub(crate) fn find_component_mut<'a>(list: &'a mut Value, name: &str) -> Option<&'a mut Value> {
    list.as_array_mut()?
        .iter_mut()
        .find(|c| c.get("name").and_then(Value::as_str) == Some(name))
}

fn declares_survey(trial: &Trial, field_type: FieldType, component: &str) -> bool {
    trial
        .parameters
        .get(field_type.as_str())
        .and_then(|list| find_component(list, component))
        .is_some_and(is_survey)
}
