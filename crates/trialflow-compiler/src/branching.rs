//! Branch and jump resolution.
//!
//! After a step completes, its conditions are tried in declaration order and
//! the first whose predicate holds decides the destination. Nothing after it
//! is evaluated. A destination among the step's declared branches is a
//! *branch* and may carry parameter overrides for the target; any other
//! destination is a *jump* and never does.

use serde::{Deserialize, Serialize};
use trialflow_model::{BranchCondition, Trial, FINISH_EXPERIMENT};
use trialflow_types::{DataLog, DataRecord};

use crate::overrides::{compile_overrides, CompiledOverride};
use crate::predicate::Predicate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Branch,
    Jump,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "step_id", rename_all = "snake_case")]
pub enum Destination {
    Step(String),
    FinishExperiment,
}

impl Destination {
    pub fn from_next_trial_id(next: Option<&str>) -> Option<Self> {
        match next {
            None | Some("") => None,
            Some(FINISH_EXPERIMENT) => Some(Destination::FinishExperiment),
            Some(id) => Some(Destination::Step(id.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledBranch {
    pub id: String,
    pub predicate: Predicate,
    /// `None` when the condition names no destination.
    pub destination: Option<Destination>,
    pub transition: TransitionKind,
    /// Always empty for jumps.
    pub overrides: Vec<CompiledOverride>,
}

/// Outcome of [`BranchTable::select`].
#[derive(Debug, Clone, PartialEq)]
pub enum BranchDecision<'a> {
    /// A condition matched and names a destination.
    Matched {
        condition_id: &'a str,
        destination: &'a Destination,
        transition: TransitionKind,
        overrides: &'a [CompiledOverride],
    },
    /// No usable match; the first declared branch applies.
    Default { target: &'a str },
    /// No usable match and no declared branch.
    Unresolved,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchTable {
    pub conditions: Vec<CompiledBranch>,
    pub default_branch: Option<String>,
}

impl BranchTable {
    /// Compile a step's conditions. `branches` are the step's declared branch
    /// targets; `owners` are the trials whose data the rules may read.
    pub fn compile(branches: &[String], conditions: &[BranchCondition], owners: &[Trial]) -> Self {
        let conditions = conditions
            .iter()
            .map(|cond| {
                let destination = Destination::from_next_trial_id(cond.next_trial_id.as_deref());
                let transition = match &destination {
                    Some(Destination::Step(id)) if branches.contains(id) => TransitionKind::Branch,
                    _ => TransitionKind::Jump,
                };
                let overrides = match transition {
                    TransitionKind::Branch => compile_overrides(&cond.custom_parameters),
                    TransitionKind::Jump => {
                        if !cond.custom_parameters.is_empty() {
                            tracing::debug!(
                                condition = %cond.id,
                                "Jump condition carries custom parameters; ignored"
                            );
                        }
                        Vec::new()
                    }
                };
                CompiledBranch {
                    id: cond.id.clone(),
                    predicate: Predicate::from_rules(&cond.rules, owners),
                    destination,
                    transition,
                    overrides,
                }
            })
            .collect();

        Self {
            conditions,
            default_branch: branches.first().cloned(),
        }
    }

    pub fn select(&self, current: Option<&DataRecord>, log: &DataLog) -> BranchDecision<'_> {
        let matched = self
            .conditions
            .iter()
            .find(|c| c.predicate.evaluate(current, log));

        if let Some(cond) = matched {
            tracing::debug!(condition = %cond.id, "Branch condition matched");
            if let Some(destination) = &cond.destination {
                return BranchDecision::Matched {
                    condition_id: &cond.id,
                    destination,
                    transition: cond.transition,
                    overrides: &cond.overrides,
                };
            }
        }

        match &self.default_branch {
            Some(target) => BranchDecision::Default { target },
            None => BranchDecision::Unresolved,
        }
    }

    /// Steps this table can reach through a branch that carries overrides.
    pub fn override_targets(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().filter_map(|c| match (&c.destination, c.transition) {
            (Some(Destination::Step(id)), TransitionKind::Branch) if !c.overrides.is_empty() => {
                Some(id.as_str())
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trialflow_model::{ColumnMappingEntry, Operator, Rule};

    fn cond(id: &str, rules: Vec<Rule>, next: Option<&str>) -> BranchCondition {
        BranchCondition {
            id: id.into(),
            rules,
            next_trial_id: next.map(String::from),
            custom_parameters: Default::default(),
        }
    }

    fn rec(v: serde_json::Value) -> DataRecord {
        DataRecord::from_json("s", v)
    }

    #[test]
    fn first_match_wins() {
        let table = BranchTable::compile(
            &["b".into(), "c".into(), "d".into()],
            &[
                cond("c1", vec![Rule::simple("score", Operator::Gt, 100)], Some("b")),
                cond("c2", vec![Rule::simple("score", Operator::Gt, 5)], Some("c")),
                cond("c3", vec![Rule::simple("score", Operator::Gt, 1)], Some("d")),
            ],
            &[],
        );
        match table.select(Some(&rec(json!({"score": 10}))), &DataLog::new()) {
            BranchDecision::Matched {
                condition_id,
                destination,
                transition,
                ..
            } => {
                assert_eq!(condition_id, "c2");
                assert_eq!(destination, &Destination::Step("c".into()));
                assert_eq!(transition, TransitionKind::Branch);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn jump_drops_custom_parameters() {
        let mut c = cond("j", vec![], Some("elsewhere"));
        c.custom_parameters
            .insert("duration".into(), ColumnMappingEntry::typed(800));
        let table = BranchTable::compile(&["b".into()], &[c], &[]);

        assert_eq!(table.conditions[0].transition, TransitionKind::Jump);
        assert!(table.conditions[0].overrides.is_empty());
        assert_eq!(table.override_targets().count(), 0);
    }

    #[test]
    fn branch_keeps_custom_parameters() {
        let mut c = cond("br", vec![], Some("b"));
        c.custom_parameters
            .insert("duration".into(), ColumnMappingEntry::typed(800));
        let table = BranchTable::compile(&["b".into()], &[c], &[]);
        assert_eq!(table.conditions[0].overrides.len(), 1);
        assert_eq!(table.override_targets().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn finish_experiment_destination() {
        let table = BranchTable::compile(&[], &[cond("end", vec![], Some(FINISH_EXPERIMENT))], &[]);
        match table.select(Some(&rec(json!({}))), &DataLog::new()) {
            BranchDecision::Matched { destination, .. } => {
                assert_eq!(destination, &Destination::FinishExperiment)
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn no_match_falls_back_to_first_branch_or_unresolved() {
        let rules = vec![Rule::simple("score", Operator::Eq, 1)];
        let with_branches =
            BranchTable::compile(&["b".into(), "c".into()], &[cond("x", rules.clone(), Some("c"))], &[]);
        assert_eq!(
            with_branches.select(Some(&rec(json!({"score": 2}))), &DataLog::new()),
            BranchDecision::Default { target: "b" }
        );

        let without = BranchTable::compile(&[], &[cond("x", rules, Some("c"))], &[]);
        assert_eq!(
            without.select(Some(&rec(json!({"score": 2}))), &DataLog::new()),
            BranchDecision::Unresolved
        );
    }

    #[test]
    fn matched_condition_without_destination_uses_default() {
        let table = BranchTable::compile(
            &["b".into()],
            &[cond("null", vec![], None), cond("later", vec![], Some("b"))],
            &[],
        );
        assert_eq!(
            table.select(Some(&rec(json!({}))), &DataLog::new()),
            BranchDecision::Default { target: "b" }
        );
    }
}
