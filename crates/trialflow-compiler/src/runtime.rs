//! Per-run state shared between a host scheduler and the compiled hooks.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trialflow_model::{CsvRow, Trial};
use uuid::Uuid;

use crate::branching::TransitionKind;
use crate::overrides::CompiledOverride;

/// Durable storage key carrying the pending repeat target across a restart.
pub const REPEAT_TARGET_KEY: &str = "trialflow_repeat_target";

/// Name of the "a branch or jump redirected control flow" session flag.
pub const BRANCHING_ACTIVE_FLAG: &str = "trialflow_branching_active";

/// Launch configuration of the step about to run. The before-step hook
/// rewrites `parameters` in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub step_id: String,
    pub parameters: Map<String, Value>,
    /// Dataset row bound to this launch, read by `csv` overrides.
    pub csv_row: Option<CsvRow>,
}

impl StepConfig {
    pub fn new(trial: &Trial, csv_row: Option<CsvRow>) -> Self {
        Self {
            step_id: trial.id.clone(),
            parameters: trial.parameters.clone(),
            csv_row,
        }
    }
}

/// How control reached a step, recorded by the previous after-step hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub from: String,
    pub to: String,
    pub transition: TransitionKind,
    /// Overrides carried by the branch. Empty for jumps.
    pub overrides: Vec<CompiledOverride>,
}

/// Mutable state of a single experiment run.
///
/// Owned by the host scheduler and lent to each hook invocation, so several
/// runs can coexist in one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    run_id: Uuid,
    branching_active: bool,
    arrival: Option<Arrival>,
    loop_branch_pending: BTreeSet<String>,
    repeat_target: Option<String>,
    restarts: usize,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            branching_active: false,
            arrival: None,
            loop_branch_pending: BTreeSet::new(),
            repeat_target: None,
            restarts: 0,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn branching_active(&self) -> bool {
        self.branching_active
    }

    pub fn mark_branching(&mut self) {
        if !self.branching_active {
            tracing::debug!(flag = BRANCHING_ACTIVE_FLAG, "Branching session activated");
        }
        self.branching_active = true;
    }

    pub fn record_arrival(&mut self, arrival: Arrival) {
        self.arrival = Some(arrival);
    }

    /// Consume the pending arrival. Returns it only when it targets `step_id`;
    /// an arrival for any other step is discarded.
    pub fn take_arrival_for(&mut self, step_id: &str) -> Option<Arrival> {
        self.arrival.take().filter(|a| a.to == step_id)
    }

    pub fn request_loop_branch(&mut self, loop_id: &str) {
        self.loop_branch_pending.insert(loop_id.to_string());
    }

    /// Clear and return the loop's "branch on finish" flag.
    pub fn take_loop_branch(&mut self, loop_id: &str) -> bool {
        self.loop_branch_pending.remove(loop_id)
    }

    pub fn request_restart(&mut self, target: &str) {
        self.repeat_target = Some(target.to_string());
    }

    pub fn pending_repeat_target(&self) -> Option<&str> {
        self.repeat_target.as_deref()
    }

    pub fn take_repeat_target(&mut self) -> Option<String> {
        self.repeat_target.take()
    }

    /// Reset per-launch state for a relaunch, keeping the run id. The pending
    /// repeat target is left for the host to consume.
    pub fn begin_restart(&mut self) {
        self.branching_active = false;
        self.arrival = None;
        self.loop_branch_pending.clear();
        self.restarts += 1;
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }
}
