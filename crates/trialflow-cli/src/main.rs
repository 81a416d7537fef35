//! CLI binary for validating, compiling and simulating Trialflow experiments.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::TryRecvError;
use trialflow_compiler::{
    compile, validate, ExperimentRunner, RunEvent, RunnerConfig, ScriptedRunner, Severity, StepGraph, StepKind,
};
use trialflow_model::{Experiment, Step};
use trialflow_types::TrialflowError;

#[derive(Parser)]
#[command(name = "trialflow", version, about = "Control-flow rule compiler for behavioral experiments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check an experiment's rules and branch graph
    Validate {
        /// Path to the experiment JSON document
        experiment: PathBuf,
    },

    /// Show the steps of an experiment with their scope and rules
    Info {
        /// Path to the experiment JSON document
        experiment: PathBuf,
    },

    /// Compile an experiment into step programs
    Compile {
        /// Path to the experiment JSON document
        experiment: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run an experiment with scripted responses
    Simulate {
        /// Path to the experiment JSON document
        experiment: PathBuf,

        /// JSON object mapping trial ids to a response or a list of responses
        #[arg(short, long)]
        responses: PathBuf,

        /// Directory for the durable repeat target (default: .trialflow/state)
        #[arg(long)]
        store: Option<PathBuf>,

        /// Maximum trial launches before aborting. Prevents runaway runs.
        #[arg(long, default_value = "10000")]
        max_steps: usize,

        /// Maximum repeat restarts before aborting
        #[arg(long, default_value = "16")]
        max_restarts: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { experiment } => cmd_validate(&experiment)?,
        Commands::Info { experiment } => cmd_info(&experiment)?,
        Commands::Compile { experiment, output } => cmd_compile(&experiment, output.as_deref())?,
        Commands::Simulate {
            experiment,
            responses,
            store,
            max_steps,
            max_restarts,
        } => {
            let mut config = RunnerConfig {
                max_steps,
                max_restarts,
                ..RunnerConfig::default()
            };
            if let Some(store) = store {
                config.store_root = store;
            }
            cmd_simulate(&experiment, &responses, config).await?;
        }
    }

    Ok(())
}

fn load_experiment(path: &Path) -> anyhow::Result<Experiment> {
    Experiment::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let experiment = load_experiment(path)?;
    let graph = StepGraph::build(&experiment)?;
    let diagnostics = validate(&experiment, &graph);

    if diagnostics.is_empty() {
        println!("Experiment is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        has_error |= diag.severity == Severity::Error;
        let location = match (&diag.step_id, &diag.condition_id) {
            (Some(step), Some(cond)) => format!(" ({step}, condition {cond})"),
            (Some(step), None) => format!(" ({step})"),
            _ => String::new(),
        };
        println!("[{}] {}: {}{}", diag.severity, diag.rule, diag.message, location);
        if let Some(fix) = &diag.fix {
            println!("        fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let experiment = load_experiment(path)?;
    let graph = StepGraph::build(&experiment)?;

    if !experiment.name.is_empty() {
        println!("Experiment: {}", experiment.name);
    }
    let loops = graph.all_steps().filter(|n| n.kind == StepKind::Loop).count();
    println!("Steps: {}", graph.len());
    println!("Trials: {}", graph.len() - loops);
    println!("Loops: {}", loops);

    println!("\nTimeline:");
    for step in &experiment.timeline {
        match step {
            Step::Trial(t) => {
                println!(
                    "  {} plugin={} {}",
                    t.id,
                    display_plugin(&t.plugin),
                    rule_summary(t.branches.len(), t.branch_conditions.len(), t.repeat_conditions.len(), t.params_override.len())
                );
            }
            Step::Loop(l) => {
                println!(
                    "  {} loop x{} {}",
                    l.id,
                    l.iterations(),
                    rule_summary(l.branches.len(), l.branch_conditions.len(), 0, 0)
                );
                for t in &l.trials {
                    println!(
                        "    {} plugin={} {}",
                        t.id,
                        display_plugin(&t.plugin),
                        rule_summary(
                            t.branches.len(),
                            t.branch_conditions.len(),
                            t.repeat_conditions.len(),
                            t.params_override.len()
                        )
                    );
                }
            }
        }
    }

    let branched: Vec<_> = graph.all_steps().filter(|n| !n.branches.is_empty()).collect();
    if !branched.is_empty() {
        println!("\nBranches:");
        for node in branched {
            let targets: Vec<_> = node.branches.iter().map(|&i| graph.node_at(i).id.as_str()).collect();
            println!("  {} -> {}", node.id, targets.join(", "));
        }
    }

    Ok(())
}

fn display_plugin(plugin: &str) -> &str {
    if plugin.is_empty() {
        "(none)"
    } else {
        plugin
    }
}

fn rule_summary(branches: usize, conditions: usize, repeats: usize, overrides: usize) -> String {
    format!("branches={branches} conditions={conditions} repeats={repeats} overrides={overrides}")
}

fn cmd_compile(path: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let experiment = load_experiment(path)?;
    let compiled = compile(&experiment)?;
    let json = compiled.to_json()?;

    match output {
        Some(out) => {
            std::fs::write(out, json).with_context(|| format!("failed to write {}", out.display()))?;
            println!(
                "Compiled {} step program(s) and {} loop program(s) to {}",
                compiled.steps.len(),
                compiled.loops.len(),
                out.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_simulate(path: &Path, responses: &Path, config: RunnerConfig) -> anyhow::Result<()> {
    let experiment = load_experiment(path)?;
    let source = std::fs::read_to_string(responses)
        .with_context(|| format!("failed to read {}", responses.display()))?;
    let scripted = ScriptedRunner::from_json(&source)?;

    let runner = ExperimentRunner::new(experiment, config)?;
    let mut events = runner.subscribe();
    let result = runner.run(&scripted).await;

    loop {
        match events.try_recv() {
            Ok(RunEvent::TransitionTaken { from, to, kind }) => println!("  {from} -> {to} ({kind:?})"),
            Ok(RunEvent::RunRestarted { target, restarts }) => {
                println!("  restart #{restarts} at {target}")
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    match result {
        Ok(result) => {
            println!("Status: {:?}", result.status);
            println!("Visited: {}", result.visited.join(" -> "));
            println!("Restarts: {}", result.restarts);
            Ok(())
        }
        Err(TrialflowError::ExperimentAborted { step, reason }) => {
            println!("Aborted at {step}: {reason}");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
