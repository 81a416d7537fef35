//! The two lifecycle hooks every trial is compiled into, plus the loop
//! after-finish hook.
//!
//! The after-step decision tree:
//! ```text
//! repeat conditions   first match with a target -> Restart (nothing else runs)
//! branch table        first match               -> Goto / FinishExperiment
//!                     no match, has branches    -> Goto first branch
//! terminal fallback   loop declares branches    -> DeferToLoop
//!                     branching session active  -> Abort
//!                     otherwise                 -> Continue
//! ```

use serde::{Deserialize, Serialize};
use trialflow_types::{DataLog, DataRecord};

use crate::branching::{BranchDecision, BranchTable, Destination, TransitionKind};
use crate::overrides::CompiledOverride;
use crate::predicate::Predicate;
use crate::runtime::{Arrival, RunContext, StepConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRepeat {
    pub id: String,
    pub predicate: Predicate,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledParamsOverride {
    pub id: String,
    pub predicate: Predicate,
    pub writes: Vec<CompiledOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideLayer {
    ParamsOverride,
    Branch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOverride {
    pub key: String,
    pub layer: OverrideLayer,
}

/// What happens when a step ends without a usable branch decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalFallback {
    /// The enclosing loop declares branches; it decides after it finishes.
    DeferToLoop { loop_id: String },
    /// Advance linearly, unless a branch already redirected this session.
    AbortIfBranched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterStepOutcome {
    Continue,
    Goto {
        target: String,
        transition: TransitionKind,
    },
    FinishExperiment,
    DeferToLoop {
        loop_id: String,
    },
    Restart {
        target: String,
    },
    Abort {
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Before-step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeforeStepHook {
    pub step_id: String,
    pub params_override: Vec<CompiledParamsOverride>,
    /// Some branch condition in the experiment targets this step with overrides.
    pub accepts_branch_overrides: bool,
}

impl BeforeStepHook {
    pub fn is_empty(&self) -> bool {
        self.params_override.is_empty() && !self.accepts_branch_overrides
    }

    /// Rewrite `config.parameters`: the first matching params-override
    /// condition, then the arrival branch's overrides, so the branch wins.
    pub fn run(&self, config: &mut StepConfig, log: &DataLog, ctx: &mut RunContext) -> Vec<AppliedOverride> {
        let arrival = ctx.take_arrival_for(&self.step_id);
        let mut applied = Vec::new();

        if let Some(cond) = self
            .params_override
            .iter()
            .find(|c| c.predicate.evaluate(None, log))
        {
            tracing::debug!(step = %self.step_id, condition = %cond.id, "Params override matched");
            apply_all(&cond.writes, config, OverrideLayer::ParamsOverride, &mut applied);
        }

        if self.accepts_branch_overrides {
            if let Some(arrival) = arrival.filter(|a| a.transition == TransitionKind::Branch) {
                apply_all(&arrival.overrides, config, OverrideLayer::Branch, &mut applied);
            }
        }
        applied
    }
}

fn apply_all(
    writes: &[CompiledOverride],
    config: &mut StepConfig,
    layer: OverrideLayer,
    applied: &mut Vec<AppliedOverride>,
) {
    for write in writes {
        if write.apply(&mut config.parameters, config.csv_row.as_ref()) {
            applied.push(AppliedOverride {
                key: write.key.to_string(),
                layer,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// After-step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AfterStepHook {
    pub step_id: String,
    pub repeat: Vec<CompiledRepeat>,
    /// `None` when the step declares neither branches nor branch conditions.
    pub branching: Option<BranchTable>,
    pub fallback: TerminalFallback,
}

impl AfterStepHook {
    pub fn run(&self, record: &DataRecord, log: &DataLog, ctx: &mut RunContext) -> AfterStepOutcome {
        let repeat = self
            .repeat
            .iter()
            .find(|c| c.predicate.evaluate(Some(record), log));
        if let Some(target) = repeat.and_then(|c| c.target.as_deref()) {
            tracing::info!(step = %self.step_id, target, "Repeat requested");
            ctx.request_restart(target);
            return AfterStepOutcome::Restart {
                target: target.to_string(),
            };
        }

        if let Some(table) = &self.branching {
            if let Some(outcome) = follow(&self.step_id, table.select(Some(record), log), ctx) {
                return outcome;
            }
        }

        match &self.fallback {
            TerminalFallback::DeferToLoop { loop_id } => {
                ctx.request_loop_branch(loop_id);
                AfterStepOutcome::DeferToLoop {
                    loop_id: loop_id.clone(),
                }
            }
            TerminalFallback::AbortIfBranched if ctx.branching_active() => AfterStepOutcome::Abort {
                reason: format!(
                    "step '{}' has no outgoing branch after control flow was redirected",
                    self.step_id
                ),
            },
            TerminalFallback::AbortIfBranched => AfterStepOutcome::Continue,
        }
    }
}

/// Turn a branch decision into an outcome, recording the arrival. `None`
/// means the decision was unresolved.
fn follow(from: &str, decision: BranchDecision<'_>, ctx: &mut RunContext) -> Option<AfterStepOutcome> {
    let (target, transition, overrides) = match decision {
        BranchDecision::Matched {
            destination: Destination::FinishExperiment,
            ..
        } => return Some(AfterStepOutcome::FinishExperiment),
        BranchDecision::Matched {
            destination: Destination::Step(target),
            transition,
            overrides,
            ..
        } => (target.as_str(), transition, overrides.to_vec()),
        BranchDecision::Default { target } => (target, TransitionKind::Branch, Vec::new()),
        BranchDecision::Unresolved => return None,
    };

    tracing::info!(from, to = target, ?transition, "Transition");
    ctx.mark_branching();
    ctx.record_arrival(Arrival {
        from: from.to_string(),
        to: target.to_string(),
        transition,
        overrides,
    });
    Some(AfterStepOutcome::Goto {
        target: target.to_string(),
        transition,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgram {
    pub before: BeforeStepHook,
    pub after: AfterStepHook,
}

// ---------------------------------------------------------------------------
// Loop after-finish
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopProgram {
    pub loop_id: String,
    pub child_ids: Vec<String>,
    pub branching: Option<BranchTable>,
}

impl LoopProgram {
    /// Runs once the loop completes. Acts only when a child deferred to it,
    /// reading the most recent record produced inside the loop.
    pub fn after_loop(&self, log: &DataLog, ctx: &mut RunContext) -> AfterStepOutcome {
        if !ctx.take_loop_branch(&self.loop_id) {
            return AfterStepOutcome::Continue;
        }
        let Some(table) = &self.branching else {
            return AfterStepOutcome::Continue;
        };
        let record = log.latest_among(&self.child_ids);
        follow(&self.loop_id, table.select(record, log), ctx).unwrap_or(AfterStepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trialflow_model::{BranchCondition, ColumnMappingEntry, Operator, ParamKey, Rule};

    use crate::overrides::OverrideValue;

    fn record(id: &str, v: serde_json::Value) -> DataRecord {
        DataRecord::from_json(id, v)
    }

    fn repeat(rules: Vec<Rule>, target: Option<&str>) -> CompiledRepeat {
        CompiledRepeat {
            id: "r".into(),
            predicate: Predicate::from_rules(&rules, &[]),
            target: target.map(String::from),
        }
    }

    fn after(step: &str, repeat: Vec<CompiledRepeat>, branching: Option<BranchTable>, fallback: TerminalFallback) -> AfterStepHook {
        AfterStepHook {
            step_id: step.into(),
            repeat,
            branching,
            fallback,
        }
    }

    #[test]
    fn repeat_short_circuits_branching() {
        let table = BranchTable::compile(
            &["B".into()],
            &[BranchCondition {
                id: "c".into(),
                rules: vec![],
                next_trial_id: Some("B".into()),
                custom_parameters: Default::default(),
            }],
            &[],
        );
        let hook = after(
            "A",
            vec![repeat(vec![Rule::simple("accuracy", Operator::Lt, "0.5")], Some("T_intro"))],
            Some(table),
            TerminalFallback::AbortIfBranched,
        );
        let mut ctx = RunContext::new();
        let out = hook.run(&record("A", json!({"accuracy": 0.3})), &DataLog::new(), &mut ctx);
        assert_eq!(out, AfterStepOutcome::Restart { target: "T_intro".into() });
        assert_eq!(ctx.pending_repeat_target(), Some("T_intro"));
        assert!(!ctx.branching_active());

        let mut ctx = RunContext::new();
        let out = hook.run(&record("A", json!({"accuracy": 0.9})), &DataLog::new(), &mut ctx);
        assert!(matches!(out, AfterStepOutcome::Goto { .. }));
        assert!(ctx.branching_active());
    }

    #[test]
    fn repeat_without_target_does_not_restart() {
        let hook = after("A", vec![repeat(vec![], None)], None, TerminalFallback::AbortIfBranched);
        let mut ctx = RunContext::new();
        assert_eq!(
            hook.run(&record("A", json!({})), &DataLog::new(), &mut ctx),
            AfterStepOutcome::Continue
        );
        assert!(ctx.pending_repeat_target().is_none());
    }

    #[test]
    fn terminal_fallback_aborts_only_after_branching() {
        let hook = after("end", vec![], None, TerminalFallback::AbortIfBranched);
        let mut ctx = RunContext::new();
        assert_eq!(hook.run(&record("end", json!({})), &DataLog::new(), &mut ctx), AfterStepOutcome::Continue);
        ctx.mark_branching();
        assert!(matches!(
            hook.run(&record("end", json!({})), &DataLog::new(), &mut ctx),
            AfterStepOutcome::Abort { .. }
        ));
    }

    #[test]
    fn deferral_sets_loop_flag() {
        let hook = after("child", vec![], None, TerminalFallback::DeferToLoop { loop_id: "L".into() });
        let mut ctx = RunContext::new();
        ctx.mark_branching();
        assert_eq!(
            hook.run(&record("child", json!({})), &DataLog::new(), &mut ctx),
            AfterStepOutcome::DeferToLoop { loop_id: "L".into() }
        );
        assert!(ctx.take_loop_branch("L"));
    }

    #[test]
    fn branch_overrides_win_over_params_override() {
        let before = BeforeStepHook {
            step_id: "B".into(),
            params_override: vec![CompiledParamsOverride {
                id: "p".into(),
                predicate: Predicate::default(),
                writes: vec![CompiledOverride {
                    key: ParamKey::plain("duration"),
                    value: OverrideValue::Literal(json!(500)),
                }],
            }],
            accepts_branch_overrides: true,
        };
        let mut ctx = RunContext::new();
        ctx.record_arrival(Arrival {
            from: "A".into(),
            to: "B".into(),
            transition: TransitionKind::Branch,
            overrides: vec![CompiledOverride {
                key: ParamKey::plain("duration"),
                value: OverrideValue::Literal(json!(800)),
            }],
        });
        let mut config = StepConfig {
            step_id: "B".into(),
            parameters: Default::default(),
            csv_row: None,
        };
        let applied = before.run(&mut config, &DataLog::new(), &mut ctx);
        assert_eq!(config.parameters["duration"], json!(800));
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].layer, OverrideLayer::Branch);
    }

    #[test]
    fn jump_arrival_applies_nothing() {
        let before = BeforeStepHook {
            step_id: "Z".into(),
            params_override: vec![],
            accepts_branch_overrides: true,
        };
        let mut ctx = RunContext::new();
        ctx.record_arrival(Arrival {
            from: "A".into(),
            to: "Z".into(),
            transition: TransitionKind::Jump,
            overrides: vec![CompiledOverride {
                key: ParamKey::plain("duration"),
                value: OverrideValue::Literal(json!(800)),
            }],
        });
        let mut config = StepConfig {
            step_id: "Z".into(),
            parameters: Default::default(),
            csv_row: None,
        };
        assert!(before.run(&mut config, &DataLog::new(), &mut ctx).is_empty());
        assert!(config.parameters.is_empty());
    }

    #[test]
    fn loop_branches_only_when_deferred() {
        let mut cond = BranchCondition {
            id: "lc".into(),
            rules: vec![Rule::simple("done", Operator::Eq, true)],
            next_trial_id: Some("after".into()),
            custom_parameters: Default::default(),
        };
        cond.custom_parameters.insert("x".into(), ColumnMappingEntry::typed(1));
        let program = LoopProgram {
            loop_id: "L".into(),
            child_ids: vec!["c1".into(), "c2".into()],
            branching: Some(BranchTable::compile(&["after".into(), "other".into()], &[cond], &[])),
        };
        let mut log = DataLog::new();
        log.push(record("c1", json!({"done": false})));
        log.push(record("c2", json!({"done": true})));

        let mut ctx = RunContext::new();
        assert_eq!(program.after_loop(&log, &mut ctx), AfterStepOutcome::Continue);

        ctx.request_loop_branch("L");
        assert_eq!(
            program.after_loop(&log, &mut ctx),
            AfterStepOutcome::Goto {
                target: "after".into(),
                transition: TransitionKind::Branch
            }
        );
        let arrival = ctx.take_arrival_for("after").unwrap();
        assert_eq!(arrival.overrides.len(), 1);
    }
}
