//! CLI binary for running and validating Stepflow workflows.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde_json::Value;
use stepflow_definition::WorkflowDefinition;
use stepflow_pipeline::{
    settings::process_overrides, EventEmitter, ExecutionContext, ExecutorConfig,
    FileCheckpointStore, Severity, StepKind, WorkflowConfig, WorkflowEvent, WorkflowExecutor,
};

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Run and validate YAML/JSON step workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow once with the given input
    Run {
        /// Path to the workflow definition (.yaml, .yml or .json)
        workflow: PathBuf,

        /// Workflow input as a JSON object
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the workflow input from a JSON file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Setting override, KEY=VALUE (repeatable). Values that parse as JSON are used as such.
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Maximum number of step visits before aborting. Prevents runaway loops.
        #[arg(long, default_value = "200")]
        max_steps: usize,

        /// Per-step timeout in seconds, for steps that do not set their own
        #[arg(long)]
        step_timeout: Option<f64>,

        /// Session id; runs sharing one resume from the same checkpoint
        #[arg(short, long)]
        session: Option<String>,

        /// Directory for per-session checkpoints
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Validate a workflow definition
    Validate {
        /// Path to the workflow definition
        workflow: PathBuf,
    },

    /// Show information about a workflow
    Info {
        /// Path to the workflow definition
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            workflow,
            input,
            input_file,
            env,
            max_steps,
            step_timeout,
            session,
            checkpoint_dir,
        } => {
            let input = read_input(input.as_deref(), input_file.as_deref())?;
            let options = RunOptions {
                env,
                max_steps,
                step_timeout,
                session,
                checkpoint_dir,
            };
            cmd_run(&workflow, input, options).await?;
        }
        Commands::Validate { workflow } => {
            cmd_validate(&workflow)?;
        }
        Commands::Info { workflow } => {
            cmd_info(&workflow)?;
        }
    }

    Ok(())
}

struct RunOptions {
    env: Vec<String>,
    max_steps: usize,
    step_timeout: Option<f64>,
    session: Option<String>,
    checkpoint_dir: Option<PathBuf>,
}

fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    stepflow_definition::load(path).with_context(|| format!("loading {}", path.display()))
}

fn read_input(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<Value> {
    let raw = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading input file {}", path.display()))?,
        (None, None) => return Ok(Value::Object(Default::default())),
    };
    let value: Value = serde_json::from_str(&raw).context("workflow input is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("workflow input must be a JSON object");
    }
    Ok(value)
}

/// Parse `KEY=VALUE` pairs. A value that parses as JSON keeps its JSON type;
/// anything else is a string.
fn parse_env_pairs(pairs: &[String]) -> anyhow::Result<IndexMap<String, Value>> {
    let mut overrides = IndexMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            anyhow::bail!("invalid --env '{pair}', expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid --env '{pair}', empty key");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        overrides.insert(key.to_string(), value);
    }
    Ok(overrides)
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let definition = load_definition(path)?;
    let config = WorkflowConfig::from_definition(&definition)?;
    let diagnostics = stepflow_pipeline::validate(&config);

    if diagnostics.is_empty() {
        println!("Workflow is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
        };
        match &diag.step_id {
            Some(step) => println!("[{}] {} ({}): {}", severity, diag.rule, step, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
        if let Some(fix) = &diag.fix {
            println!("    fix: {}", fix);
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let definition = load_definition(path)?;
    let mut ctx = ExecutionContext::parse(definition, &IndexMap::new())?;
    ctx.plan()?;
    let config = ctx.config();

    println!("Workflow: {}", config.agent.id);
    if !config.agent.name.is_empty() {
        println!("Name: {}", config.agent.name);
    }
    if let Some(description) = &config.agent.description {
        println!("Description: {}", description);
    }
    println!("Steps: {}", config.steps.len());
    println!("Settings: {}", ctx.settings().len());

    println!("\nSteps:");
    for step in &config.steps {
        let detail = match &step.kind {
            StepKind::Plain(p) => format!("workload={} next={:?}", p.workload, p.next),
            StepKind::Condition(c) => format!(
                "after={} targets={:?}",
                c.prev,
                c.router.all_targets().collect::<Vec<_>>()
            ),
            StepKind::LoopAggregation(a) => format!(
                "aggregates={:?} next={:?}",
                a.aggregation.keys().collect::<Vec<_>>(),
                a.next
            ),
        };
        println!("  {} [{}] {}", step.id, step.kind_name(), detail);
    }

    if let Some(plan) = ctx.planned() {
        println!("\nState slots:");
        for field in &plan.schema.fields {
            println!("  {}", field.name);
        }
        if !plan.diagnostics.is_empty() {
            println!("\nWarnings:");
            for diag in &plan.diagnostics {
                println!("  {}: {}", diag.rule, diag.message);
            }
        }
    }

    Ok(())
}

fn log_run_start(workflow: &str, config: &ExecutorConfig) {
    tracing::info!(
        workflow = %workflow,
        max_steps = config.max_steps,
        session = ?config.session_id,
        checkpoints = config.checkpoints.is_some(),
        "Running workflow"
    );
}

async fn cmd_run(path: &Path, input: Value, options: RunOptions) -> anyhow::Result<()> {
    let definition = load_definition(path)?;

    let mut overrides = process_overrides(&definition.agent.env);
    overrides.extend(parse_env_pairs(&options.env)?);

    let mut ctx = ExecutionContext::parse(definition, &overrides)?;
    ctx.plan()?;
    for diag in ctx.diagnostics() {
        eprintln!("[WARN] {}: {}", diag.rule, diag.message);
    }

    let events = EventEmitter::default();
    let mut rx = events.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                WorkflowEvent::StepCompleted { step, duration_ms } => {
                    eprintln!("  [done] {} ({}ms)", step, duration_ms);
                }
                WorkflowEvent::StepFailed { step, error } => {
                    eprintln!("  [failed] {}: {}", step, error);
                }
                WorkflowEvent::BranchSelected { condition, branch, targets } => {
                    eprintln!("  [branch] {} took '{}' to {:?}", condition, branch, targets);
                }
                WorkflowEvent::RunCompleted { .. } | WorkflowEvent::RunFailed { .. } => break,
                _ => {}
            }
        }
    });

    let step_timeout = match options.step_timeout {
        Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => anyhow::bail!("--step-timeout must be a positive number, got {secs}"),
        None => None,
    };
    let config = ExecutorConfig {
        max_steps: options.max_steps,
        checkpoints: options
            .checkpoint_dir
            .map(|dir| Arc::new(FileCheckpointStore::new(dir)) as Arc<dyn stepflow_pipeline::CheckpointStore>),
        events: Some(events),
        session_id: options.session,
        step_timeout,
    };

    log_run_start(&ctx.config().agent.id, &config);
    println!("Running workflow: {}", ctx.config().agent.id);
    println!("Step limit: {}", config.max_steps);

    let executor = WorkflowExecutor::new(stepflow_pipeline::default_registry()).with_config(config);
    let result = executor.execute(&mut ctx, input).await;
    // Dropping the executor closes the event channel.
    drop(executor);
    let _ = progress.await;

    let output = result?;
    println!("\nWorkflow completed");
    if let Some(run_id) = ctx.run_id() {
        println!("Session: {}", run_id);
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    ctx.finish();

    Ok(())
}
