//! Conductor CLI - Batch Task Dispatch
//!
//! Loads the conductor configuration and a JSON task file, dispatches every
//! task across the configured backends and prints the outcomes together with
//! the performance report.
//!
//! # Usage
//!
//! ```bash
//! # Run a batch against local Ollama models
//! conductor run --tasks tasks.json
//!
//! # Dry run with simulated backends, machine-readable output
//! conductor run --tasks tasks.json --simulate --json
//!
//! # Show the effective backend catalog
//! conductor backends --config ./conductor.toml
//!
//! # Verbose logging
//! RUST_LOG=model_conductor=debug conductor run --tasks tasks.json
//! ```
//!
//! # Task File
//!
//! ```json
//! [
//!   {"task_type": "coding", "description": "Write a tokenizer", "complexity": "complex"},
//!   {"task_type": "review", "description": "Review the tokenizer"}
//! ]
//! ```
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C): cancels every in-flight task; partial results are still
//!   printed

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use model_conductor::routing::FixedEvaluator;
use model_conductor::{
    default_config_path, load_config_from_path, BackendStats, ConductorConfig, ConfigOverrides,
    DegradedPolicy, DispatchError, ModelBackend, OllamaBackend, Orchestrator, Recommendation,
    SimulatedBackend, Task, TaskResult, TaskType,
};

/// Conductor - dispatch development tasks across local model backends
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "CONDUCTOR_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CONDUCTOR_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dispatch every task in a task file
    Run {
        /// JSON file holding an array of tasks
        #[arg(short = 't', long, value_name = "FILE")]
        tasks: PathBuf,

        /// Use simulated backends instead of Ollama
        #[arg(long)]
        simulate: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Override the attempt budget
        #[arg(long)]
        max_attempts: Option<usize>,

        /// Override the quality threshold
        #[arg(long)]
        quality_threshold: Option<f64>,

        /// Override the degraded policy (hard_failure, best_effort)
        #[arg(long, value_parser = parse_policy)]
        degraded_policy: Option<DegradedPolicy>,
    },

    /// Print the effective backend catalog
    Backends,
}

fn parse_policy(s: &str) -> Result<DegradedPolicy, String> {
    DegradedPolicy::parse(s).ok_or_else(|| format!("unknown degraded policy '{s}'"))
}

/// One line of batch output
#[derive(Debug, Serialize)]
struct TaskOutcome {
    task_id: String,
    task_type: TaskType,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TaskOutcome {
    fn new(task: &Task, outcome: Result<TaskResult, DispatchError>) -> Self {
        let (status, result, error) = match outcome {
            Ok(result) if result.degraded => ("degraded", Some(result), None),
            Ok(result) => ("succeeded", Some(result), None),
            Err(e) => {
                let status = match &e {
                    DispatchError::Cancelled { .. } => "cancelled",
                    DispatchError::NoEligibleBackend { .. } => "ineligible",
                    _ => "failed",
                };
                (status, e.result().cloned(), Some(e.to_string()))
            }
        };

        Self {
            task_id: task.id.to_string(),
            task_type: task.task_type,
            status,
            result,
            error,
        }
    }

    fn succeeded(&self) -> bool {
        matches!(self.status, "succeeded" | "degraded")
    }
}

/// Full batch output for `--json`
#[derive(Debug, Serialize)]
struct BatchReport<'a> {
    tasks: &'a [TaskOutcome],
    report: BTreeMap<String, BackendStats>,
    recommendations: BTreeMap<TaskType, Vec<Recommendation>>,
}

fn read_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file: {path:?}"))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid task file: {path:?}"))
}

async fn build_orchestrator(mut config: ConductorConfig, simulate: bool) -> Result<Orchestrator> {
    if simulate {
        info!(backends = config.backends.len(), "Using simulated backends");
        let orchestrator = Orchestrator::from_config(&config, |backend| {
            Arc::new(
                SimulatedBackend::new(backend.name.clone())
                    .with_latency(Duration::from_millis(200)),
            ) as Arc<dyn ModelBackend>
        })?;
        return Ok(orchestrator.with_evaluator(Arc::new(FixedEvaluator(0.8))));
    }

    let client = OllamaBackend::from_env().context("Failed to create Ollama client")?;
    match client.list_models().await {
        Ok(installed) => config.retain_installed(&installed),
        Err(e) => warn!(error = %e, "Could not list installed models, using the full catalog"),
    }
    if config.backends.is_empty() {
        warn!("No configured backend is installed on the Ollama server");
    }

    let ollama: Arc<dyn ModelBackend> = Arc::new(client);
    Ok(Orchestrator::from_config(&config, |_| Arc::clone(&ollama))?)
}

fn print_human(outcomes: &[TaskOutcome], orchestrator: &Orchestrator) {
    for outcome in outcomes {
        println!("== {} [{}] {}", outcome.task_id, outcome.task_type, outcome.status);
        if let Some(result) = &outcome.result {
            for attempt in &result.attempts {
                let verdict = attempt
                    .error_kind
                    .map_or_else(|| "ok".to_string(), |k| k.to_string());
                println!(
                    "   {:<28} {:>8.2}s  quality {:.2}  {}",
                    attempt.backend_name,
                    attempt.elapsed.as_secs_f64(),
                    attempt.quality_score,
                    verdict
                );
            }
            if let Some(response) = &result.response {
                println!("{response}");
            }
        }
        if let Some(error) = &outcome.error {
            println!("   error: {error}");
        }
        println!();
    }

    println!("== Backend report");
    for (backend, stats) in orchestrator.report() {
        println!(
            "   {:<28} count {:>4}  success {:>5.1}%  latency {:>7.2}s  quality {:.2}  cost {:.4}",
            backend,
            stats.count,
            stats.success_rate * 100.0,
            stats.avg_latency.as_secs_f64(),
            stats.avg_quality,
            stats.total_cost
        );
    }

    let recommendations = orchestrator.recommendations();
    if !recommendations.is_empty() {
        println!();
        println!("== Recommendations");
        for (task_type, ranked) in recommendations {
            let names: Vec<&str> = ranked.iter().map(|r| r.backend.as_str()).collect();
            println!("   {:<14} {}", task_type.as_str(), names.join(", "));
        }
    }
}

async fn run(
    config: ConductorConfig,
    tasks_path: &Path,
    simulate: bool,
    json: bool,
) -> Result<()> {
    let tasks = read_tasks(tasks_path)?;
    let orchestrator = build_orchestrator(config, simulate).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling in-flight tasks");
                cancel.cancel();
            }
        });
    }

    let options = orchestrator.options().with_cancellation(cancel);
    let results = orchestrator
        .execute_all_with(tasks.clone(), &options)
        .await;

    let outcomes: Vec<TaskOutcome> = tasks
        .iter()
        .zip(results)
        .map(|(task, outcome)| TaskOutcome::new(task, outcome))
        .collect();

    if json {
        let batch = BatchReport {
            tasks: &outcomes,
            report: orchestrator.report(),
            recommendations: orchestrator.recommendations(),
        };
        println!("{}", serde_json::to_string_pretty(&batch)?);
    } else {
        print_human(&outcomes, &orchestrator);
    }

    let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
    info!(total = outcomes.len(), failed, "Batch finished");
    if failed > 0 {
        anyhow::bail!("{failed} of {} task(s) did not succeed", outcomes.len());
    }
    Ok(())
}

fn print_backends(config: &ConductorConfig) {
    match &config.config_file_path {
        Some(path) => println!("# from {}", path.display()),
        None => println!("# built-in catalog ({})", config.source()),
    }
    for backend in &config.backends {
        let task_types: Vec<&str> = backend
            .supported_task_types
            .iter()
            .map(TaskType::as_str)
            .collect();
        println!(
            "{:<28} {:<9} limit {:>2}  weight {:>3}  {}",
            backend.name,
            backend.tier.to_string(),
            backend.concurrency_limit,
            backend.priority_weight,
            task_types.join(",")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so `--json` output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "model_conductor={0},conductor={0}",
                    args.log_level
                ))
            }),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;

    match args.command {
        Command::Run {
            tasks,
            simulate,
            json,
            max_attempts,
            quality_threshold,
            degraded_policy,
        } => {
            let overrides = ConfigOverrides {
                max_attempts,
                quality_threshold,
                degraded_policy,
            };
            overrides
                .apply(&mut config)
                .context("Invalid command-line override")?;
            run(config, &tasks, simulate, json).await
        }
        Command::Backends => {
            print_backends(&config);
            Ok(())
        }
    }
}
