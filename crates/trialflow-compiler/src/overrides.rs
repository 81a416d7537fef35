//! Parameter overrides: compiled value descriptors and the writer that
//! applies them to a step's launch parameters.
//!
//! Every write fails closed. An unknown component, a missing question or a
//! missing dataset column leaves the parameter at its default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trialflow_model::{ColumnMappingEntry, CsvRow, ParamKey, ValueSource};

use crate::predicate::find_component_mut;

/// Where an override's value comes from at launch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum OverrideValue {
    Literal(Value),
    Column(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledOverride {
    pub key: ParamKey,
    pub value: OverrideValue,
}

impl CompiledOverride {
    pub fn resolve_value(&self, csv_row: Option<&CsvRow>) -> Option<Value> {
        match &self.value {
            OverrideValue::Literal(v) => Some(v.clone()),
            OverrideValue::Column(column) => csv_row?.get(column).cloned(),
        }
    }

    /// Write this override into `params`. Returns `false` when it was skipped.
    pub fn apply(&self, params: &mut Map<String, Value>, csv_row: Option<&CsvRow>) -> bool {
        let Some(value) = self.resolve_value(csv_row) else {
            tracing::warn!(key = %self.key, "Override skipped: dataset column not available");
            return false;
        };
        if write_param(params, &self.key, value) {
            true
        } else {
            tracing::warn!(key = %self.key, "Override skipped: target not found in step parameters");
            false
        }
    }
}

/// Compile an editing-layer override map. Entries with source `none`,
/// malformed keys, or non-string column names are dropped.
pub fn compile_overrides(entries: &BTreeMap<String, ColumnMappingEntry>) -> Vec<CompiledOverride> {
    entries
        .iter()
        .filter_map(|(raw_key, entry)| {
            let value = match entry.source {
                ValueSource::None => return None,
                ValueSource::Typed => OverrideValue::Literal(entry.value.clone()),
                ValueSource::Csv => match entry.value.as_str() {
                    Some(column) if !column.is_empty() => OverrideValue::Column(column.to_string()),
                    _ => {
                        tracing::warn!(key = %raw_key, "csv override has no column name; skipped");
                        return None;
                    }
                },
            };
            match ParamKey::parse(raw_key) {
                Ok(key) => Some(CompiledOverride { key, value }),
                Err(err) => {
                    tracing::warn!(key = %raw_key, error = %err, "Override skipped");
                    None
                }
            }
        })
        .collect()
}

/// Write `value` at `key` inside a step's parameter object.
pub fn write_param(params: &mut Map<String, Value>, key: &ParamKey, value: Value) -> bool {
    match key {
        ParamKey::Plain(name) => {
            params.insert(name.clone(), value);
            true
        }
        ParamKey::Component {
            field_type,
            component,
            prop,
        } => write_component(params, field_type.as_str(), component, |element| {
            element.insert(prop.clone(), value);
            Some(())
        }),
        ParamKey::SurveyQuestion {
            field_type,
            component,
            question,
        } => write_component(params, field_type.as_str(), component, |element| {
            let questions = element
                .get_mut("survey_json")?
                .get_mut("elements")?
                .as_array_mut()?;
            let target = questions
                .iter_mut()
                .find(|q| q.get("name").and_then(Value::as_str) == Some(question.as_str()))?;
            target
                .as_object_mut()?
                .insert("defaultValue".to_string(), value);
            Some(())
        }),
    }
}

fn write_component(
    params: &mut Map<String, Value>,
    field: &str,
    component: &str,
    write: impl FnOnce(&mut Map<String, Value>) -> Option<()>,
) -> bool {
    params
        .get_mut(field)
        .and_then(|list| find_component_mut(list, component))
        .and_then(Value::as_object_mut)
        .and_then(write)
        .is_some()
}
