//! Rule compiler and reference driver for Trialflow experiments.
//!
//! [`compile`] turns an authored [`trialflow_model::Experiment`] into a
//! [`CompiledExperiment`]: per trial a before-step hook (parameter
//! overrides) and an after-step hook (repeat, branch/jump, terminal
//! fallback), per loop an after-finish hook. Hooks are typed programs
//! interpreted against collected data and a [`RunContext`] owned by the
//! host. [`ExperimentRunner`] is a host that executes them.

pub mod branching;
pub mod compile;
pub mod driver;
pub mod events;
pub mod graph;
pub mod hooks;
pub mod overrides;
pub mod predicate;
pub mod runtime;
pub mod store;
pub mod validation;

pub use branching::{BranchDecision, BranchTable, CompiledBranch, Destination, TransitionKind};
pub use compile::{assemble, compile, CompiledExperiment};
pub use driver::{ExperimentRunner, RunResult, RunStatus, RunnerConfig, ScriptedRunner, StepRunner};
pub use events::{EventEmitter, RunEvent};
pub use graph::{StepGraph, StepKind, StepNode};
pub use hooks::{
    AfterStepHook, AfterStepOutcome, AppliedOverride, BeforeStepHook, LoopProgram, OverrideLayer, StepProgram,
    TerminalFallback,
};
pub use overrides::{compile_overrides, write_param, CompiledOverride, OverrideValue};
pub use predicate::{compare, CompiledRule, DataSource, Lookup, Predicate};
pub use runtime::{Arrival, RunContext, StepConfig, BRANCHING_ACTIVE_FLAG, REPEAT_TARGET_KEY};
pub use store::{clear_repeat_target, load_repeat_target, save_repeat_target, RepeatCheckpoint};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
