//! Authoring-time validation: lint rules and diagnostics.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to
//! fail when any `Error`-severity issue is present. Errors mark experiments
//! whose control flow cannot run as authored (unknown or out-of-scope
//! destinations, branch cycles); warnings mark rules that can never match
//! and overrides that will always be skipped.

use std::collections::{BTreeSet, HashSet};

use trialflow_model::{BranchCondition, ColumnMappingEntry, Experiment, ParamKey, Step, Trial, ValueSource};
use trialflow_types::TrialflowError;

use crate::branching::Destination;
use crate::graph::StepGraph;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step_id: Option<String>,
    pub condition_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

impl Diagnostic {
    fn new(rule: &str, severity: Severity, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message,
            step_id: None,
            condition_id: None,
            fix: None,
        }
    }

    fn at(mut self, step: &str) -> Self {
        self.step_id = Some(step.into());
        self
    }

    fn condition(mut self, id: &str) -> Self {
        self.condition_id = Some(id.into());
        self
    }

    fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, experiment: &Experiment, graph: &StepGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Every step that can carry branches, loops and nested trials alike.
struct BranchingStep<'a> {
    id: &'a str,
    branches: &'a [String],
    conditions: &'a [BranchCondition],
}

fn branching_steps(experiment: &Experiment) -> Vec<BranchingStep<'_>> {
    let mut out = Vec::new();
    for step in &experiment.timeline {
        out.push(BranchingStep {
            id: step.id(),
            branches: step.branches(),
            conditions: step.branch_conditions(),
        });
        if let Step::Loop(l) = step {
            out.extend(l.trials.iter().map(|t| BranchingStep {
                id: &t.id,
                branches: &t.branches,
                conditions: &t.branch_conditions,
            }));
        }
    }
    out
}

/// Trials paired with the dataset columns visible to them (own plus enclosing loop).
fn trials_with_columns(experiment: &Experiment) -> Vec<(&Trial, BTreeSet<&str>)> {
    let mut out = Vec::new();
    for step in &experiment.timeline {
        match step {
            Step::Trial(t) => out.push((t, t.csv_columns.iter().map(String::as_str).collect())),
            Step::Loop(l) => {
                for t in &l.trials {
                    let cols = t
                        .csv_columns
                        .iter()
                        .chain(&l.csv_columns)
                        .map(String::as_str)
                        .collect();
                    out.push((t, cols));
                }
            }
        }
    }
    out
}

fn destination(cond: &BranchCondition) -> Option<Destination> {
    Destination::from_next_trial_id(cond.next_trial_id.as_deref())
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct BranchTargetExistsRule;
impl LintRule for BranchTargetExistsRule {
    fn name(&self) -> &str { "branch_target_exists" }
    fn apply(&self, _experiment: &Experiment, graph: &StepGraph) -> Vec<Diagnostic> {
        graph
            .all_steps()
            .flat_map(|node| {
                node.unresolved_branches.iter().map(|target| {
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Step '{}' declares branch to unknown step '{target}'", node.id),
                    )
                    .at(&node.id)
                    .fix(format!("Remove '{target}' from the branches of '{}'", node.id))
                })
            })
            .collect()
    }
}

struct BranchScopeRule;
impl LintRule for BranchScopeRule {
    fn name(&self) -> &str { "branch_scope" }
    fn apply(&self, _experiment: &Experiment, graph: &StepGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.all_steps() {
            for &target in &node.branches {
                let target = &graph.node_at(target).id;
                if !graph.same_scope(&node.id, target) {
                    diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!(
                                "Step '{}' branches to '{target}', which is outside its scope",
                                node.id
                            ),
                        )
                        .at(&node.id)
                        .fix("Use a jump (a condition target outside branches) to leave the scope"),
                    );
                }
            }
        }
        diags
    }
}

struct ConditionTargetExistsRule;
impl LintRule for ConditionTargetExistsRule {
    fn name(&self) -> &str { "condition_target_exists" }
    fn apply(&self, experiment: &Experiment, graph: &StepGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in branching_steps(experiment) {
            for cond in step.conditions {
                match destination(cond) {
                    Some(Destination::Step(target)) if !graph.contains(&target) => diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!("Condition on '{}' targets unknown step '{target}'", step.id),
                        )
                        .at(step.id)
                        .condition(&cond.id),
                    ),
                    None => diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Warning,
                            format!("Condition on '{}' has no destination", step.id),
                        )
                        .at(step.id)
                        .condition(&cond.id)
                        .fix("Set nextTrialId, or FINISH_EXPERIMENT to end the run"),
                    ),
                    _ => {}
                }
            }
        }
        diags
    }
}

struct RepeatTargetExistsRule;
impl LintRule for RepeatTargetExistsRule {
    fn name(&self) -> &str { "repeat_target_exists" }
    fn apply(&self, experiment: &Experiment, graph: &StepGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for trial in experiment.trials() {
            for cond in &trial.repeat_conditions {
                match cond.jump_to_trial_id.as_deref() {
                    Some(target) if !target.is_empty() && !graph.contains(target) => diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!("Repeat condition on '{}' targets unknown step '{target}'", trial.id),
                        )
                        .at(&trial.id)
                        .condition(&cond.id),
                    ),
                    None | Some("") => diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Warning,
                            format!("Repeat condition on '{}' has no target and never restarts", trial.id),
                        )
                        .at(&trial.id)
                        .condition(&cond.id),
                    ),
                    _ => {}
                }
            }
        }
        diags
    }
}

struct OverrideSourceExistsRule;
impl LintRule for OverrideSourceExistsRule {
    fn name(&self) -> &str { "override_source_exists" }
    fn apply(&self, experiment: &Experiment, graph: &StepGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for trial in experiment.trials() {
            for cond in &trial.params_override {
                for rule in &cond.rules {
                    if !rule.trial_id.is_empty() && !graph.contains(&rule.trial_id) {
                        diags.push(
                            Diagnostic::new(
                                self.name(),
                                Severity::Warning,
                                format!(
                                    "Params override on '{}' reads unknown step '{}'; it can never match",
                                    trial.id, rule.trial_id
                                ),
                            )
                            .at(&trial.id)
                            .condition(&cond.id),
                        );
                    }
                }
            }
        }
        diags
    }
}

struct RulePropSetRule;
impl LintRule for RulePropSetRule {
    fn name(&self) -> &str { "rule_prop_set" }
    fn apply(&self, experiment: &Experiment, _graph: &StepGraph) -> Vec<Diagnostic> {
        let never = |step: &str, cond: &str| {
            Diagnostic::new(
                self.name(),
                Severity::Warning,
                format!("Condition '{cond}' on '{step}' has a rule with no property; it can never match"),
            )
            .at(step)
            .condition(cond)
        };

        let mut diags = Vec::new();
        for step in branching_steps(experiment) {
            for cond in step.conditions {
                if cond.rules.iter().any(|r| !r.is_addressed()) {
                    diags.push(never(step.id, &cond.id));
                }
            }
        }
        for trial in experiment.trials() {
            for cond in &trial.repeat_conditions {
                if cond.rules.iter().any(|r| !r.is_addressed()) {
                    diags.push(never(&trial.id, &cond.id));
                }
            }
            for cond in &trial.params_override {
                if cond.rules.iter().any(|r| !r.is_addressed()) {
                    diags.push(never(&trial.id, &cond.id));
                }
            }
        }
        diags
    }
}

struct ParamKeySyntaxRule;
impl LintRule for ParamKeySyntaxRule {
    fn name(&self) -> &str { "param_key_syntax" }
    fn apply(&self, experiment: &Experiment, _graph: &StepGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut check = |step: &str, cond: &str, key: &str| {
            if let Err(err) = ParamKey::parse(key) {
                diags.push(
                    Diagnostic::new(self.name(), Severity::Warning, format!("{err}; override skipped"))
                        .at(step)
                        .condition(cond),
                );
            }
        };

        for step in branching_steps(experiment) {
            for cond in step.conditions {
                for key in cond.custom_parameters.keys() {
                    check(step.id, &cond.id, key);
                }
            }
        }
        for trial in experiment.trials() {
            for cond in &trial.params_override {
                for key in cond.params_to_override.keys() {
                    check(&trial.id, &cond.id, key);
                }
            }
        }
        diags
    }
}

struct CsvColumnKnownRule;
impl LintRule for CsvColumnKnownRule {
    fn name(&self) -> &str { "csv_column_known" }
    fn apply(&self, experiment: &Experiment, _graph: &StepGraph) -> Vec<Diagnostic> {
        let columns_of: Vec<_> = trials_with_columns(experiment);
        let lookup = |id: &str| columns_of.iter().find(|(t, _)| t.id == id).map(|(_, c)| c);

        let unknown = |step: &str, cond: &str, key: &str, entry: &ColumnMappingEntry, cols: Option<&BTreeSet<&str>>| {
            if entry.source != ValueSource::Csv {
                return None;
            }
            let column = entry.value.as_str().unwrap_or_default();
            if cols.is_some_and(|c| c.contains(column)) {
                return None;
            }
            Some(
                Diagnostic::new(
                    self.name(),
                    Severity::Warning,
                    format!("Override '{key}' on '{step}' reads csv column '{column}', which is not in the bound dataset"),
                )
                .at(step)
                .condition(cond),
            )
        };

        let mut diags = Vec::new();
        for (trial, cols) in &columns_of {
            for cond in &trial.params_override {
                for (key, entry) in &cond.params_to_override {
                    diags.extend(unknown(&trial.id, &cond.id, key, entry, Some(cols)));
                }
            }
        }
        // Branch overrides are applied to, and read the dataset of, the target.
        for step in branching_steps(experiment) {
            for cond in step.conditions {
                let Some(Destination::Step(target)) = destination(cond) else {
                    continue;
                };
                if !step.branches.contains(&target) {
                    continue;
                }
                for (key, entry) in &cond.custom_parameters {
                    diags.extend(unknown(&target, &cond.id, key, entry, lookup(&target)));
                }
            }
        }
        diags
    }
}

struct BranchAcyclicRule;
impl LintRule for BranchAcyclicRule {
    fn name(&self) -> &str { "branch_acyclic" }
    fn apply(&self, experiment: &Experiment, graph: &StepGraph) -> Vec<Diagnostic> {
        // Adjacency over arena indices: declared branches plus condition destinations.
        let mut edges: Vec<Vec<usize>> = graph.all_steps().map(|n| n.branches.clone()).collect();
        for step in branching_steps(experiment) {
            let Some(from) = graph.index_of(step.id) else {
                continue;
            };
            for cond in step.conditions {
                if let Some(Destination::Step(target)) = destination(cond) {
                    if let Some(to) = graph.index_of(&target) {
                        if !edges[from].contains(&to) {
                            edges[from].push(to);
                        }
                    }
                }
            }
        }

        let mut state = vec![Mark::Unvisited; edges.len()];
        let mut reported = HashSet::new();
        let mut diags = Vec::new();
        for start in 0..edges.len() {
            let mut path = Vec::new();
            find_cycles(start, &edges, &mut state, &mut path, &mut |cycle: &[usize]| {
                let mut key: Vec<usize> = cycle.to_vec();
                key.sort_unstable();
                if !reported.insert(key) {
                    return;
                }
                let ids: Vec<&str> = cycle
                    .iter()
                    .chain(cycle.first())
                    .map(|&i| graph.node_at(i).id.as_str())
                    .collect();
                let head = ids[0];
                diags.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Branch cycle without a repeat: {}", ids.join(" -> ")),
                    )
                    .at(head)
                    .fix("Break the cycle, or use a repeat condition to restart the run"),
                );
            });
        }
        diags
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

fn find_cycles(
    node: usize,
    edges: &[Vec<usize>],
    state: &mut [Mark],
    path: &mut Vec<usize>,
    report: &mut dyn FnMut(&[usize]),
) {
    match state[node] {
        Mark::Done => return,
        Mark::OnPath => {
            if let Some(pos) = path.iter().position(|&n| n == node) {
                report(&path[pos..]);
            }
            return;
        }
        Mark::Unvisited => {}
    }
    state[node] = Mark::OnPath;
    path.push(node);
    for &next in &edges[node] {
        find_cycles(next, edges, state, path, report);
    }
    path.pop();
    state[node] = Mark::Done;
}

struct JumpOverridesIgnoredRule;
impl LintRule for JumpOverridesIgnoredRule {
    fn name(&self) -> &str { "jump_overrides_ignored" }
    fn apply(&self, experiment: &Experiment, _graph: &StepGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in branching_steps(experiment) {
            for cond in step.conditions {
                let is_branch = matches!(
                    destination(cond),
                    Some(Destination::Step(ref t)) if step.branches.contains(t)
                );
                if !is_branch && !cond.custom_parameters.is_empty() {
                    diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Info,
                            format!(
                                "Condition on '{}' is a jump; its {} custom parameter(s) are ignored",
                                step.id,
                                cond.custom_parameters.len()
                            ),
                        )
                        .at(step.id)
                        .condition(&cond.id),
                    );
                }
            }
        }
        diags
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn validate(experiment: &Experiment, graph: &StepGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(BranchTargetExistsRule),
        Box::new(BranchScopeRule),
        Box::new(ConditionTargetExistsRule),
        Box::new(RepeatTargetExistsRule),
        Box::new(OverrideSourceExistsRule),
        Box::new(RulePropSetRule),
        Box::new(ParamKeySyntaxRule),
        Box::new(CsvColumnKnownRule),
        Box::new(BranchAcyclicRule),
        Box::new(JumpOverridesIgnoredRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(experiment, graph));
    }
    diagnostics
}

pub fn validate_or_raise(experiment: &Experiment, graph: &StepGraph) -> trialflow_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(experiment, graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(TrialflowError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(json: &str) -> Vec<Diagnostic> {
        let exp = Experiment::from_json(json).unwrap();
        let graph = StepGraph::build(&exp).unwrap();
        validate(&exp, &graph)
    }

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    #[test]
    fn clean_experiment_passes() {
        let diags = check(
            r#"{ "timeline": [
                { "type": "trial", "id": "intro", "branches": ["A", "B"],
                  "branchConditions": [ { "id": 1, "rules": [ { "prop": "key", "value": "f" } ], "nextTrialId": "A" } ] },
                { "type": "trial", "id": "A",
                  "branchConditions": [ { "id": 2, "rules": [], "nextTrialId": "FINISH_EXPERIMENT" } ] },
                { "type": "trial", "id": "B" }
            ] }"#,
        );
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
    }

    #[test]
    fn unknown_targets_are_errors() {
        let diags = check(
            r#"{ "timeline": [
                { "type": "trial", "id": "a", "branches": ["ghost"],
                  "branchConditions": [ { "id": 1, "rules": [], "nextTrialId": "nowhere" } ],
                  "repeatConditions": [ { "id": 2, "rules": [], "jumpToTrialId": "gone" } ] }
            ] }"#,
        );
        assert!(has(&diags, "branch_target_exists", Severity::Error));
        assert!(has(&diags, "condition_target_exists", Severity::Error));
        assert!(has(&diags, "repeat_target_exists", Severity::Error));
    }

    #[test]
    fn branch_into_loop_child_is_out_of_scope() {
        let diags = check(
            r#"{ "timeline": [
                { "type": "trial", "id": "a", "branches": ["inner"] },
                { "type": "loop", "id": "L", "trials": [ { "id": "inner" } ] }
            ] }"#,
        );
        let d = diags.iter().find(|d| d.rule == "branch_scope").unwrap();
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.step_id.as_deref(), Some("a"));
    }

    #[test]
    fn branch_cycle_reported_once() {
        let diags = check(
            r#"{ "timeline": [
                { "type": "trial", "id": "a", "branches": ["b"] },
                { "type": "trial", "id": "b",
                  "branchConditions": [ { "id": 1, "rules": [], "nextTrialId": "a" } ] }
            ] }"#,
        );
        let cycles: Vec<_> = diags.iter().filter(|d| d.rule == "branch_acyclic").collect();
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].message.contains("a -> b -> a"), "{}", cycles[0].message);
    }

    #[test]
    fn repeat_edges_do_not_form_cycles() {
        let diags = check(
            r#"{ "timeline": [
                { "type": "trial", "id": "intro" },
                { "type": "trial", "id": "practice",
                  "repeatConditions": [ { "id": 1, "rules": [ { "prop": "accuracy", "op": "<", "value": "0.5" } ],
                                          "jumpToTrialId": "intro" } ] }
            ] }"#,
        );
        assert!(!diags.iter().any(|d| d.rule == "branch_acyclic"));
    }

    #[test]
    fn warnings_for_unmatchable_rules_and_bad_keys() {
        let diags = check(
            r#"{ "timeline": [
                { "type": "trial", "id": "a", "branches": ["b"],
                  "branchConditions": [ { "id": 1, "rules": [ { "prop": "" } ], "nextTrialId": "b",
                      "customParameters": { "components::x": { "source": "typed", "value": 1 },
                                            "prompt": { "source": "csv", "value": "missing_col" } } } ] },
                { "type": "trial", "id": "b", "csvColumns": ["prompt_col"],
                  "paramsOverride": [ { "id": 3, "rules": [ { "trialId": "zzz", "prop": "rt", "value": 1 } ],
                                        "paramsToOverride": {} } ] }
            ] }"#,
        );
        assert!(has(&diags, "rule_prop_set", Severity::Warning));
        assert!(has(&diags, "param_key_syntax", Severity::Warning));
        assert!(has(&diags, "csv_column_known", Severity::Warning));
        assert!(has(&diags, "override_source_exists", Severity::Warning));
        assert!(!diags.iter().any(|d| d.severity == Severity::Error));
    }

    #[test]
    fn loop_columns_visible_to_children() {
        let diags = check(
            r#"{ "timeline": [
                { "type": "loop", "id": "L", "csvColumns": ["word"], "trials": [
                    { "id": "t", "paramsOverride": [ { "id": 1, "rules": [],
                        "paramsToOverride": { "stimulus": { "source": "csv", "value": "word" } } } ] }
                ] }
            ] }"#,
        );
        assert!(!diags.iter().any(|d| d.rule == "csv_column_known"), "{diags:?}");
    }

    #[test]
    fn jump_with_custom_parameters_is_info() {
        let diags = check(
            r#"{ "timeline": [
                { "type": "trial", "id": "a",
                  "branchConditions": [ { "id": 1, "rules": [], "nextTrialId": "z",
                      "customParameters": { "duration": { "source": "typed", "value": 800 } } } ] },
                { "type": "trial", "id": "z" }
            ] }"#,
        );
        assert!(has(&diags, "jump_overrides_ignored", Severity::Info));
    }

    #[test]
    fn validate_or_raise_joins_errors() {
        let exp = Experiment::from_json(
            r#"{ "timeline": [ { "type": "trial", "id": "a", "branches": ["x", "y"] } ] }"#,
        )
        .unwrap();
        let graph = StepGraph::build(&exp).unwrap();
        match validate_or_raise(&exp, &graph) {
            Err(TrialflowError::ValidationError(msg)) => {
                assert!(msg.contains("'x'") && msg.contains("'y'"), "{msg}");
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }
}
