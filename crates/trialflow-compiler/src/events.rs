//! Run events for observers.
//!
//! [`ExperimentRunner`](crate::driver::ExperimentRunner) publishes
//! [`RunEvent`]s on a [`tokio::sync::broadcast`] channel. Emitting never
//! blocks and never fails; events sent with no subscriber are dropped.

use serde::{Deserialize, Serialize};

use crate::branching::TransitionKind;
use crate::hooks::OverrideLayer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        experiment: String,
    },
    RunCompleted {
        run_id: String,
        visited: usize,
        duration_ms: u64,
    },
    StepStarted {
        step_id: String,
        iteration: usize,
    },
    StepCompleted {
        step_id: String,
    },
    OverrideApplied {
        step_id: String,
        key: String,
        layer: OverrideLayer,
    },
    TransitionTaken {
        from: String,
        to: String,
        kind: TransitionKind,
    },
    RepeatRequested {
        step_id: String,
        target: String,
    },
    RunRestarted {
        target: String,
        restarts: usize,
    },
    ExperimentFinished {
        step_id: String,
    },
    ExperimentAborted {
        step_id: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
