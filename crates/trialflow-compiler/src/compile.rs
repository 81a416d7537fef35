//! Assembles step programs from an authored experiment.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use trialflow_model::{Experiment, LoopStep, Step, Trial};
use trialflow_types::Result;

use crate::branching::BranchTable;
use crate::graph::StepGraph;
use crate::hooks::{
    AfterStepHook, BeforeStepHook, CompiledParamsOverride, CompiledRepeat, LoopProgram, StepProgram,
    TerminalFallback,
};
use crate::overrides::compile_overrides;
use crate::predicate::Predicate;
use crate::validation::{validate_or_raise, Severity};

/// Executable form of an experiment: one [`StepProgram`] per trial and one
/// [`LoopProgram`] per loop, keyed by step id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledExperiment {
    pub name: String,
    pub steps: BTreeMap<String, StepProgram>,
    pub loops: BTreeMap<String, LoopProgram>,
}

impl CompiledExperiment {
    pub fn step(&self, id: &str) -> Option<&StepProgram> {
        self.steps.get(id)
    }

    pub fn loop_program(&self, id: &str) -> Option<&LoopProgram> {
        self.loops.get(id)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }
}

/// Validate and compile. Fails on duplicate step ids or any `Error`-severity
/// diagnostic; warnings are logged.
pub fn compile(experiment: &Experiment) -> Result<CompiledExperiment> {
    let graph = StepGraph::build(experiment)?;
    let diagnostics = validate_or_raise(experiment, &graph)?;
    for d in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
        tracing::warn!(rule = %d.rule, step = ?d.step_id, "{}", d.message);
    }
    let compiled = assemble(experiment, &graph);
    tracing::info!(
        experiment = %compiled.name,
        steps = compiled.steps.len(),
        loops = compiled.loops.len(),
        "Experiment compiled"
    );
    Ok(compiled)
}

/// Build programs without validating. `graph` must come from `experiment`.
pub fn assemble(experiment: &Experiment, graph: &StepGraph) -> CompiledExperiment {
    let trials_by_id: HashMap<&str, &Trial> = experiment.trials().map(|t| (t.id.as_str(), t)).collect();
    let owner_of = |id: &str| trials_by_id.get(id).copied();

    let mut compiled = CompiledExperiment {
        name: experiment.name.clone(),
        ..Default::default()
    };

    for step in &experiment.timeline {
        match step {
            Step::Trial(trial) => {
                let program = compile_trial(trial, None, &owner_of);
                compiled.steps.insert(trial.id.clone(), program);
            }
            Step::Loop(l) => {
                for trial in &l.trials {
                    let program = compile_trial(trial, Some(l), &owner_of);
                    compiled.steps.insert(trial.id.clone(), program);
                }
                compiled.loops.insert(l.id.clone(), compile_loop(l, graph));
            }
        }
    }

    let override_targets: HashSet<String> = compiled
        .steps
        .values()
        .filter_map(|p| p.after.branching.as_ref())
        .chain(compiled.loops.values().filter_map(|p| p.branching.as_ref()))
        .flat_map(|t| t.override_targets().map(String::from))
        .collect();
    for (id, program) in compiled.steps.iter_mut() {
        program.before.accepts_branch_overrides = override_targets.contains(id);
    }

    compiled
}

fn has_branching(branches: &[String], conditions: &[trialflow_model::BranchCondition]) -> bool {
    !branches.is_empty() || !conditions.is_empty()
}

fn compile_trial<'a>(
    trial: &'a Trial,
    enclosing: Option<&LoopStep>,
    owner_of: &impl Fn(&str) -> Option<&'a Trial>,
) -> StepProgram {
    let params_override = trial
        .params_override
        .iter()
        .map(|cond| CompiledParamsOverride {
            id: cond.id.clone(),
            predicate: Predicate::from_override_rules(&cond.rules, owner_of),
            writes: compile_overrides(&cond.params_to_override),
        })
        .collect();

    let repeat = trial
        .repeat_conditions
        .iter()
        .map(|cond| CompiledRepeat {
            id: cond.id.clone(),
            predicate: Predicate::from_rules(&cond.rules, std::slice::from_ref(trial)),
            target: cond.jump_to_trial_id.clone().filter(|t| !t.is_empty()),
        })
        .collect();

    let branching = has_branching(&trial.branches, &trial.branch_conditions)
        .then(|| BranchTable::compile(&trial.branches, &trial.branch_conditions, std::slice::from_ref(trial)));

    let fallback = match enclosing {
        Some(l) if has_branching(&l.branches, &l.branch_conditions) => TerminalFallback::DeferToLoop {
            loop_id: l.id.clone(),
        },
        _ => TerminalFallback::AbortIfBranched,
    };

    StepProgram {
        before: BeforeStepHook {
            step_id: trial.id.clone(),
            params_override,
            accepts_branch_overrides: false,
        },
        after: AfterStepHook {
            step_id: trial.id.clone(),
            repeat,
            branching,
            fallback,
        },
    }
}

/// Loop conditions read the latest record of any child, so every child's
/// component declarations take part in survey detection.
fn compile_loop(l: &LoopStep, graph: &StepGraph) -> LoopProgram {
    LoopProgram {
        loop_id: l.id.clone(),
        child_ids: graph.children(&l.id).map(|n| n.id.clone()).collect(),
        branching: has_branching(&l.branches, &l.branch_conditions)
            .then(|| BranchTable::compile(&l.branches, &l.branch_conditions, &l.trials)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialflow_types::TrialflowError;

    use crate::branching::TransitionKind;
    use crate::predicate::{CompiledRule, Lookup};

    const EXPERIMENT: &str = r#"{
        "name": "demo",
        "timeline": [
            { "type": "trial", "id": "intro", "branches": ["easy", "hard"],
              "branchConditions": [
                  { "id": 1, "rules": [ { "prop": "score", "op": ">=", "value": 8 } ], "nextTrialId": "hard",
                    "customParameters": { "duration": { "source": "typed", "value": 800 } } },
                  { "id": 2, "rules": [ { "prop": "score", "op": "<", "value": 0 } ], "nextTrialId": "outro",
                    "customParameters": { "duration": { "source": "typed", "value": 1 } } }
              ] },
            { "type": "trial", "id": "easy",
              "branchConditions": [ { "id": 3, "nextTrialId": "FINISH_EXPERIMENT" } ] },
            { "type": "trial", "id": "hard",
              "paramsOverride": [ { "id": 4, "rules": [ { "trialId": "intro", "prop": "rt", "op": ">", "value": 500 } ],
                                    "paramsToOverride": { "duration": { "source": "typed", "value": 500 } } } ],
              "branchConditions": [ { "id": 5, "nextTrialId": "FINISH_EXPERIMENT" } ] },
            { "type": "loop", "id": "block", "branches": ["outro"], "trials": [
                { "id": "fix" },
                { "id": "stim", "repeatConditions": [ { "id": 6, "rules": [ { "prop": "correct", "value": false } ],
                                                        "jumpToTrialId": "intro" } ] }
            ] },
            { "type": "trial", "id": "outro" }
        ]
    }"#;

    fn compiled() -> CompiledExperiment {
        compile(&Experiment::from_json(EXPERIMENT).unwrap()).unwrap()
    }

    #[test]
    fn programs_per_trial_and_loop() {
        let c = compiled();
        assert_eq!(c.name, "demo");
        let ids: Vec<_> = c.steps.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["easy", "fix", "hard", "intro", "outro", "stim"]);
        assert_eq!(c.loops["block"].child_ids, vec!["fix".to_string(), "stim".to_string()]);
    }

    #[test]
    fn branch_and_jump_classified() {
        let c = compiled();
        let table = c.step("intro").unwrap().after.branching.as_ref().unwrap();
        assert_eq!(table.conditions[0].transition, TransitionKind::Branch);
        assert_eq!(table.conditions[1].transition, TransitionKind::Jump);
        assert!(table.conditions[1].overrides.is_empty());
        assert_eq!(table.default_branch.as_deref(), Some("easy"));
    }

    #[test]
    fn only_branch_override_targets_accept_overrides() {
        let c = compiled();
        assert!(c.step("hard").unwrap().before.accepts_branch_overrides);
        assert!(!c.step("outro").unwrap().before.accepts_branch_overrides);
        assert!(!c.step("easy").unwrap().before.accepts_branch_overrides);
        assert!(c.step("easy").unwrap().before.is_empty());
        assert!(!c.step("hard").unwrap().before.is_empty());
    }

    #[test]
    fn loop_children_defer_to_branching_loop() {
        let c = compiled();
        let fix = &c.step("fix").unwrap().after;
        assert!(fix.branching.is_none());
        assert_eq!(fix.fallback, TerminalFallback::DeferToLoop { loop_id: "block".into() });
        assert_eq!(c.step("outro").unwrap().after.fallback, TerminalFallback::AbortIfBranched);
        assert_eq!(c.step("stim").unwrap().after.repeat[0].target.as_deref(), Some("intro"));
    }

    #[test]
    fn loop_conditions_see_survey_children() {
        let exp = Experiment::from_json(
            r#"{ "timeline": [
                { "type": "loop", "id": "block", "branches": ["adult", "minor"], "trials": [
                    { "id": "q", "parameters": { "response_components": [ { "name": "demo", "type": "SurveyComponent" } ] } }
                ], "branchConditions": [
                    { "id": 1, "rules": [ { "fieldType": "response_components", "componentIdx": "demo",
                                            "prop": "age", "op": ">=", "value": 18 } ], "nextTrialId": "adult" }
                ] },
                { "type": "trial", "id": "adult" },
                { "type": "trial", "id": "minor" }
            ] }"#,
        )
        .unwrap();
        let c = compile(&exp).unwrap();
        let table = c.loop_program("block").unwrap().branching.as_ref().unwrap();
        match &table.conditions[0].predicate.rules[0] {
            CompiledRule::Compare { lookup, .. } => {
                assert!(matches!(lookup, Lookup::SurveyAnswer { question, .. } if question == "age"))
            }
            other => panic!("unexpected rule: {other:?}"),
        }
    }

    #[test]
    fn compiled_experiment_serializes() {
        let c = compiled();
        let json = c.to_json().unwrap();
        let back = CompiledExperiment::from_json(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn validation_errors_block_compilation() {
        let exp = Experiment::from_json(
            r#"{ "timeline": [
                { "type": "trial", "id": "a", "branches": ["b"] },
                { "type": "trial", "id": "b", "branches": ["a"] }
            ] }"#,
        )
        .unwrap();
        assert!(matches!(compile(&exp), Err(TrialflowError::ValidationError(_))));
    }
}
