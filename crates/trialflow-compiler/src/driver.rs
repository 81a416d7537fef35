//! Reference host driver.
//!
//! [`ExperimentRunner`] walks the timeline the way a host runtime would:
//! before-step hook, launch, after-step hook, then follow the outcome. Loops
//! iterate once per dataset row (or `repetitions` times) and run their
//! after-finish hook when the last iteration ends. A repeat persists its
//! target, resets the run and relaunches from the top, fast-forwarding to
//! the stored target.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trialflow_model::{CsvRow, Experiment, Step, Trial};
use trialflow_types::{DataLog, DataRecord, Result, TrialflowError, ELAPSED_TIME_FIELD};
use uuid::Uuid;

use crate::compile::{compile, CompiledExperiment};
use crate::events::{EventEmitter, RunEvent};
use crate::hooks::AfterStepOutcome;
use crate::runtime::{RunContext, StepConfig};
use crate::store::{clear_repeat_target, load_repeat_target, save_repeat_target, RepeatCheckpoint};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Produces the data record of one trial launch.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(&self, trial: &Trial, config: &StepConfig) -> Result<Map<String, Value>>;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory holding the durable repeat target.
    pub store_root: PathBuf,
    /// Trial launches allowed across all restarts.
    pub max_steps: usize,
    pub max_restarts: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from(".trialflow/state"),
            max_steps: 10_000,
            max_restarts: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Ran off the end of the timeline.
    Completed,
    /// A condition targeted `FINISH_EXPERIMENT`.
    Finished,
}

#[derive(Debug)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Every trial launched, in order, across restarts.
    pub visited: Vec<String>,
    pub restarts: usize,
    /// Data collected since the last restart.
    pub data: DataLog,
}

// ---------------------------------------------------------------------------
// Walk state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// About to enter `timeline[index]`.
    Top(usize),
    /// About to launch child `child` of the loop at `timeline[top]`.
    InLoop { top: usize, child: usize, iteration: usize },
    /// The loop at `timeline[index]` finished its last iteration.
    LoopDone(usize),
}

enum Flow {
    Next(Cursor),
    Finish,
    Restart(String),
}

// ---------------------------------------------------------------------------
// ExperimentRunner
// ---------------------------------------------------------------------------

pub struct ExperimentRunner {
    experiment: Experiment,
    compiled: CompiledExperiment,
    config: RunnerConfig,
    emitter: EventEmitter,
}

impl ExperimentRunner {
    /// Compile `experiment` and prepare a runner for it.
    pub fn new(experiment: Experiment, config: RunnerConfig) -> Result<Self> {
        let compiled = compile(&experiment)?;
        Ok(Self {
            experiment,
            compiled,
            config,
            emitter: EventEmitter::default(),
        })
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn compiled(&self) -> &CompiledExperiment {
        &self.compiled
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.emitter.subscribe()
    }

    pub async fn run(&self, runner: &dyn StepRunner) -> Result<RunResult> {
        let started = Instant::now();
        let mut ctx = RunContext::new();
        let mut log = DataLog::new();
        let mut visited = Vec::new();
        let run_id = ctx.run_id();

        tracing::info!(experiment = %self.experiment.name, %run_id, "Run started");
        self.emitter.emit(RunEvent::RunStarted {
            run_id: run_id.to_string(),
            experiment: self.experiment.name.clone(),
        });

        let status = 'launch: loop {
            let mut cursor = Cursor::Top(0);
            if let Some(checkpoint) = load_repeat_target(&self.config.store_root).await? {
                clear_repeat_target(&self.config.store_root).await?;
                ctx.take_repeat_target();
                if checkpoint.experiment == self.experiment.name {
                    tracing::info!(target = %checkpoint.target_step_id, "Fast-forwarding to repeat target");
                    cursor = self.locate(&checkpoint.target_step_id, cursor)?;
                } else {
                    tracing::warn!(
                        written_by = %checkpoint.experiment,
                        target = %checkpoint.target_step_id,
                        "Discarding repeat target left by another experiment"
                    );
                }
            }

            loop {
                let flow = match cursor {
                    Cursor::Top(i) if i >= self.experiment.timeline.len() => break 'launch RunStatus::Completed,
                    Cursor::Top(i) => match &self.experiment.timeline[i] {
                        Step::Trial(trial) => {
                            let row = trial.csv_rows.first().cloned();
                            let outcome = self
                                .launch(trial, row, 0, &mut ctx, &mut log, &mut visited, runner, started)
                                .await?;
                            self.follow(&trial.id, outcome, Cursor::Top(i + 1), cursor, &ctx)?
                        }
                        Step::Loop(l) if l.trials.is_empty() || l.iterations() == 0 => {
                            Flow::Next(Cursor::LoopDone(i))
                        }
                        Step::Loop(_) => Flow::Next(Cursor::InLoop {
                            top: i,
                            child: 0,
                            iteration: 0,
                        }),
                    },
                    Cursor::InLoop { top, child, iteration } => {
                        let Step::Loop(l) = &self.experiment.timeline[top] else {
                            return Err(TrialflowError::Other(format!("timeline entry {top} is not a loop")));
                        };
                        let trial = &l.trials[child];
                        let row = l
                            .csv_rows
                            .get(iteration)
                            .or_else(|| trial.csv_rows.first())
                            .cloned();
                        let linear = if child + 1 < l.trials.len() {
                            Cursor::InLoop { top, child: child + 1, iteration }
                        } else if iteration + 1 < l.iterations() {
                            Cursor::InLoop { top, child: 0, iteration: iteration + 1 }
                        } else {
                            Cursor::LoopDone(top)
                        };
                        let outcome = self
                            .launch(trial, row, iteration, &mut ctx, &mut log, &mut visited, runner, started)
                            .await?;
                        self.follow(&trial.id, outcome, linear, cursor, &ctx)?
                    }
                    Cursor::LoopDone(i) => {
                        let loop_id = self.experiment.timeline[i].id();
                        let outcome = match self.compiled.loop_program(loop_id) {
                            Some(program) => program.after_loop(&log, &mut ctx),
                            None => AfterStepOutcome::Continue,
                        };
                        self.follow(loop_id, outcome, Cursor::Top(i + 1), cursor, &ctx)?
                    }
                };

                match flow {
                    Flow::Next(next) => cursor = next,
                    Flow::Finish => break 'launch RunStatus::Finished,
                    Flow::Restart(target) => {
                        if ctx.restarts() >= self.config.max_restarts {
                            return Err(TrialflowError::RestartBudgetExhausted {
                                restarts: ctx.restarts(),
                            });
                        }
                        let checkpoint = RepeatCheckpoint::new(&self.experiment.name, target.clone(), run_id);
                        save_repeat_target(&checkpoint, &self.config.store_root).await?;
                        ctx.begin_restart();
                        log.clear();
                        tracing::info!(%target, restarts = ctx.restarts(), "Run restarted");
                        self.emitter.emit(RunEvent::RunRestarted {
                            target,
                            restarts: ctx.restarts(),
                        });
                        continue 'launch;
                    }
                }
            }
        };

        tracing::info!(?status, visited = visited.len(), restarts = ctx.restarts(), "Run completed");
        self.emitter.emit(RunEvent::RunCompleted {
            run_id: run_id.to_string(),
            visited: visited.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        Ok(RunResult {
            run_id,
            status,
            visited,
            restarts: ctx.restarts(),
            data: log,
        })
    }

    /// Run one trial through both hooks.
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        trial: &Trial,
        csv_row: Option<CsvRow>,
        iteration: usize,
        ctx: &mut RunContext,
        log: &mut DataLog,
        visited: &mut Vec<String>,
        runner: &dyn StepRunner,
        started: Instant,
    ) -> Result<AfterStepOutcome> {
        if visited.len() >= self.config.max_steps {
            return Err(TrialflowError::StepBudgetExhausted {
                steps: self.config.max_steps,
            });
        }
        let program = self
            .compiled
            .step(&trial.id)
            .ok_or_else(|| TrialflowError::UnknownStep { id: trial.id.clone() })?;

        let mut config = StepConfig::new(trial, csv_row);
        for applied in program.before.run(&mut config, log, ctx) {
            self.emitter.emit(RunEvent::OverrideApplied {
                step_id: trial.id.clone(),
                key: applied.key,
                layer: applied.layer,
            });
        }

        tracing::debug!(step = %trial.id, iteration, "Step started");
        self.emitter.emit(RunEvent::StepStarted {
            step_id: trial.id.clone(),
            iteration,
        });
        let mut values = runner.run_step(trial, &config).await?;
        values
            .entry(ELAPSED_TIME_FIELD)
            .or_insert_with(|| Value::from(started.elapsed().as_millis() as u64));
        let record = DataRecord::new(trial.id.clone(), values);
        log.push(record.clone());
        visited.push(trial.id.clone());
        self.emitter.emit(RunEvent::StepCompleted {
            step_id: trial.id.clone(),
        });

        Ok(program.after.run(&record, log, ctx))
    }

    fn follow(
        &self,
        from: &str,
        outcome: AfterStepOutcome,
        linear: Cursor,
        current: Cursor,
        ctx: &RunContext,
    ) -> Result<Flow> {
        match outcome {
            AfterStepOutcome::Continue | AfterStepOutcome::DeferToLoop { .. } => Ok(Flow::Next(linear)),
            AfterStepOutcome::Goto { target, transition } => {
                self.emitter.emit(RunEvent::TransitionTaken {
                    from: from.to_string(),
                    to: target.clone(),
                    kind: transition,
                });
                Ok(Flow::Next(self.locate(&target, current)?))
            }
            AfterStepOutcome::FinishExperiment => {
                tracing::info!(step = from, "Experiment finished");
                self.emitter.emit(RunEvent::ExperimentFinished {
                    step_id: from.to_string(),
                });
                Ok(Flow::Finish)
            }
            AfterStepOutcome::Restart { target } => {
                self.emitter.emit(RunEvent::RepeatRequested {
                    step_id: from.to_string(),
                    target: target.clone(),
                });
                Ok(Flow::Restart(target))
            }
            AfterStepOutcome::Abort { reason } => {
                tracing::warn!(step = from, run_id = %ctx.run_id(), %reason, "Experiment aborted");
                self.emitter.emit(RunEvent::ExperimentAborted {
                    step_id: from.to_string(),
                    reason: reason.clone(),
                });
                Err(TrialflowError::ExperimentAborted {
                    step: from.to_string(),
                    reason,
                })
            }
        }
    }

    /// Cursor for `target`. A loop child reached from inside the same loop
    /// keeps the current iteration; from anywhere else it starts at the first.
    fn locate(&self, target: &str, current: Cursor) -> Result<Cursor> {
        for (top, step) in self.experiment.timeline.iter().enumerate() {
            if step.id() == target {
                return Ok(Cursor::Top(top));
            }
            if let Step::Loop(l) = step {
                if let Some(child) = l.trials.iter().position(|t| t.id == target) {
                    let iteration = match current {
                        Cursor::InLoop { top: t, iteration, .. } if t == top => iteration,
                        _ => 0,
                    };
                    return Ok(Cursor::InLoop { top, child, iteration });
                }
            }
        }
        Err(TrialflowError::UnknownStep { id: target.to_string() })
    }
}

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// Canned responses per trial id. The n-th launch of a trial gets its n-th
/// response; once exhausted the last one repeats. Trials without responses
/// produce an empty record.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: HashMap<String, Vec<Map<String, Value>>>,
    calls: Mutex<HashMap<String, usize>>,
    launches: Mutex<Vec<StepConfig>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, trial_id: impl Into<String>, response: Value) -> Self {
        let values = match response {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.responses.entry(trial_id.into()).or_default().push(values);
        self
    }

    /// Parse `{ "<trial id>": {..} | [{..}, ..] }`.
    pub fn from_json(source: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(source)?;
        let Value::Object(entries) = value else {
            return Err(TrialflowError::DocumentError(
                "responses must be an object keyed by trial id".into(),
            ));
        };
        let mut runner = Self::new();
        for (trial_id, entry) in entries {
            let items = match entry {
                Value::Array(items) => items,
                other => vec![other],
            };
            for item in items {
                if !item.is_object() {
                    return Err(TrialflowError::DocumentError(format!(
                        "response for '{trial_id}' must be an object"
                    )));
                }
                runner = runner.respond(trial_id.clone(), item);
            }
        }
        Ok(runner)
    }

    /// Launch configurations seen so far, in order.
    pub fn launches(&self) -> Vec<StepConfig> {
        self.launches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run_step(&self, trial: &Trial, config: &StepConfig) -> Result<Map<String, Value>> {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(config.clone());

        let n = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            let count = calls.entry(trial.id.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let response = self
            .responses
            .get(&trial.id)
            .and_then(|list| list.get(n).or_else(|| list.last()))
            .cloned()
            .unwrap_or_default();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(dir: &tempfile::TempDir) -> RunnerConfig {
        RunnerConfig {
            store_root: dir.path().join("state"),
            ..RunnerConfig::default()
        }
    }

    fn runner(json: &str, dir: &tempfile::TempDir) -> ExperimentRunner {
        ExperimentRunner::new(Experiment::from_json(json).unwrap(), config(dir)).unwrap()
    }

    #[test]
    fn default_config() {
        let c = RunnerConfig::default();
        assert_eq!(c.store_root, PathBuf::from(".trialflow/state"));
        assert_eq!(c.max_steps, 10_000);
        assert_eq!(c.max_restarts, 16);
    }

    #[tokio::test]
    async fn linear_timeline_completes() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(
            r#"{ "timeline": [
                { "type": "trial", "id": "a" },
                { "type": "loop", "id": "L", "repetitions": 2, "trials": [ { "id": "x" }, { "id": "y" } ] },
                { "type": "trial", "id": "b" }
            ] }"#,
            &dir,
        );
        let result = r.run(&ScriptedRunner::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.visited, vec!["a", "x", "y", "x", "y", "b"]);
        assert!(result.data.last().unwrap().elapsed_ms().is_some());
    }

    #[tokio::test]
    async fn loop_rows_feed_csv_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(
            r#"{ "timeline": [
                { "type": "loop", "id": "L", "csvColumns": ["word"],
                  "csvRows": [ { "word": "red" }, { "word": "blue" } ],
                  "trials": [ { "id": "stim", "parameters": { "stimulus": "" },
                      "paramsOverride": [ { "id": 1, "rules": [],
                          "paramsToOverride": { "stimulus": { "source": "csv", "value": "word" } } } ] } ] }
            ] }"#,
            &dir,
        );
        let scripted = ScriptedRunner::new();
        r.run(&scripted).await.unwrap();
        let stimuli: Vec<_> = scripted
            .launches()
            .iter()
            .map(|c| c.parameters["stimulus"].clone())
            .collect();
        assert_eq!(stimuli, vec![json!("red"), json!("blue")]);
    }

    #[tokio::test]
    async fn step_budget_guards_runaway_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.max_steps = 3;
        let exp = Experiment::from_json(
            r#"{ "timeline": [ { "type": "loop", "id": "L", "repetitions": 5, "trials": [ { "id": "t" } ] } ] }"#,
        )
        .unwrap();
        let r = ExperimentRunner::new(exp, cfg).unwrap();
        match r.run(&ScriptedRunner::new()).await {
            Err(TrialflowError::StepBudgetExhausted { steps }) => assert_eq!(steps, 3),
            other => panic!("expected StepBudgetExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn restart_budget_guards_endless_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.max_restarts = 2;
        let exp = Experiment::from_json(
            r#"{ "timeline": [
                { "type": "trial", "id": "intro" },
                { "type": "trial", "id": "quiz",
                  "repeatConditions": [ { "id": 1, "rules": [ { "prop": "ok", "value": false } ], "jumpToTrialId": "intro" } ] }
            ] }"#,
        )
        .unwrap();
        let r = ExperimentRunner::new(exp, cfg).unwrap();
        let scripted = ScriptedRunner::new().respond("quiz", json!({"ok": false}));
        match r.run(&scripted).await {
            Err(TrialflowError::RestartBudgetExhausted { restarts }) => assert_eq!(restarts, 2),
            other => panic!("expected RestartBudgetExhausted, got {other:?}"),
        }
    }

    #[test]
    fn scripted_responses_from_json() {
        let s = ScriptedRunner::from_json(r#"{ "a": { "x": 1 }, "b": [ { "n": 1 }, { "n": 2 } ] }"#).unwrap();
        assert_eq!(s.responses["a"].len(), 1);
        assert_eq!(s.responses["b"].len(), 2);
        assert!(ScriptedRunner::from_json("[1, 2]").is_err());
        assert!(ScriptedRunner::from_json(r#"{ "a": [1] }"#).is_err());
    }

    #[tokio::test]
    async fn scripted_responses_repeat_last() {
        let s = ScriptedRunner::new()
            .respond("t", json!({"n": 1}))
            .respond("t", json!({"n": 2}));
        let trial = Trial::new("t", "p");
        let cfg = StepConfig::new(&trial, None);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(s.run_step(&trial, &cfg).await.unwrap()["n"].clone());
        }
        assert_eq!(seen, vec![json!(1), json!(2), json!(2)]);
        assert!(s
            .run_step(&Trial::new("other", "p"), &cfg)
            .await
            .unwrap()
            .is_empty());
    }
}
