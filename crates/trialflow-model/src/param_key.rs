//! Structured addressing of step parameters.
//!
//! The editing layer stores override targets as `::`-separated strings:
//!
//! ```text
//! paramKey                                              plain plugin parameter
//! fieldType::componentIdx::propKey                      property of a named component
//! fieldType::componentIdx::survey_json::questionName    question inside a survey component
//! ```
//!
//! [`ParamKey`] carries the same information as a tagged variant. Parsing and
//! formatting round-trip exactly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use trialflow_types::TrialflowError;

use crate::condition::FieldType;

pub const KEY_SEPARATOR: &str = "::";
pub const SURVEY_JSON_SEGMENT: &str = "survey_json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKey {
    Plain(String),
    Component {
        field_type: FieldType,
        component: String,
        prop: String,
    },
    SurveyQuestion {
        field_type: FieldType,
        component: String,
        question: String,
    },
}

impl ParamKey {
    pub fn plain(key: impl Into<String>) -> Self {
        ParamKey::Plain(key.into())
    }

    /// Decode a `::`-separated key.
    pub fn parse(key: &str) -> Result<Self, TrialflowError> {
        let segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(malformed(key, segments.len()));
        }
        match segments.as_slice() {
            [plain] => Ok(ParamKey::Plain((*plain).to_string())),
            [field, component, prop] => Ok(ParamKey::Component {
                field_type: parse_field_type(key, field)?,
                component: (*component).to_string(),
                prop: (*prop).to_string(),
            }),
            [field, component, survey, question] if *survey == SURVEY_JSON_SEGMENT => {
                Ok(ParamKey::SurveyQuestion {
                    field_type: parse_field_type(key, field)?,
                    component: (*component).to_string(),
                    question: (*question).to_string(),
                })
            }
            _ => Err(malformed(key, segments.len())),
        }
    }

    /// Build a key from the separate fields the editing forms carry.
    pub fn from_parts(parts: &KeyParts) -> Result<Self, TrialflowError> {
        match (&parts.field_type, &parts.component_idx) {
            (None, _) => Self::parse(&parts.prop),
            (Some(field_type), Some(component)) => {
                let key = match &parts.question_name {
                    Some(question) if parts.prop == SURVEY_JSON_SEGMENT => {
                        ParamKey::SurveyQuestion {
                            field_type: *field_type,
                            component: component.clone(),
                            question: question.clone(),
                        }
                    }
                    _ => ParamKey::Component {
                        field_type: *field_type,
                        component: component.clone(),
                        prop: parts.prop.clone(),
                    },
                };
                // Re-parse so empty segments are rejected the same way.
                Self::parse(&key.to_string())
            }
            (Some(_), None) => Err(malformed(&parts.prop, 2)),
        }
    }

    pub fn to_parts(&self) -> KeyParts {
        match self {
            ParamKey::Plain(key) => KeyParts {
                field_type: None,
                component_idx: None,
                prop: key.clone(),
                question_name: None,
            },
            ParamKey::Component {
                field_type,
                component,
                prop,
            } => KeyParts {
                field_type: Some(*field_type),
                component_idx: Some(component.clone()),
                prop: prop.clone(),
                question_name: None,
            },
            ParamKey::SurveyQuestion {
                field_type,
                component,
                question,
            } => KeyParts {
                field_type: Some(*field_type),
                component_idx: Some(component.clone()),
                prop: SURVEY_JSON_SEGMENT.to_string(),
                question_name: Some(question.clone()),
            },
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            ParamKey::Plain(_) => None,
            ParamKey::Component { field_type, .. } | ParamKey::SurveyQuestion { field_type, .. } => {
                Some(*field_type)
            }
        }
    }

    pub fn component(&self) -> Option<&str> {
        match self {
            ParamKey::Plain(_) => None,
            ParamKey::Component { component, .. } | ParamKey::SurveyQuestion { component, .. } => {
                Some(component)
            }
        }
    }
}

fn parse_field_type(key: &str, segment: &str) -> Result<FieldType, TrialflowError> {
    FieldType::parse(segment).ok_or_else(|| {
        TrialflowError::DocumentError(format!(
            "parameter key '{key}' names unknown field type '{segment}'"
        ))
    })
}

fn malformed(key: &str, segments: usize) -> TrialflowError {
    TrialflowError::InvalidParamKey {
        key: key.to_string(),
        segments,
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::Plain(key) => f.write_str(key),
            ParamKey::Component {
                field_type,
                component,
                prop,
            } => write!(f, "{field_type}{KEY_SEPARATOR}{component}{KEY_SEPARATOR}{prop}"),
            ParamKey::SurveyQuestion {
                field_type,
                component,
                question,
            } => write!(
                f,
                "{field_type}{sep}{component}{sep}{SURVEY_JSON_SEGMENT}{sep}{question}",
                sep = KEY_SEPARATOR
            ),
        }
    }
}

impl FromStr for ParamKey {
    type Err = TrialflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParamKey::parse(s)
    }
}

impl Serialize for ParamKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ParamKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ParamKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Key fields as the editing forms hold them before encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyParts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_idx: Option<String>,
    pub prop: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_name: Option<String>,
}
