use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use cascade_engine::{Engine, EngineConfig, EngineEvent};
use cascade_store::{HistoryStore, SqliteStore};
use cascade_workflow::Workflow;

/// Cascade - a declarative workflow execution engine
#[derive(Parser)]
#[command(name = "cascade")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.cascade)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a workflow definition, reading inputs as JSON from stdin
  Run {
    /// Path to the workflow definition file (JSON)
    workflow_file: PathBuf,

    /// Read inputs from this JSON file instead of stdin
    #[arg(long)]
    inputs: Option<PathBuf>,
  },

  /// Validate a workflow definition without executing anything
  Validate {
    /// Path to the workflow definition file (JSON)
    workflow_file: PathBuf,
  },

  /// Show past runs of a workflow, most recent first
  History {
    /// The workflow name as declared in its definition
    workflow: String,

    /// Maximum number of runs to show
    #[arg(long, default_value_t = 10)]
    limit: u32,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".cascade")
  });

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Commands::Run {
      workflow_file,
      inputs,
    } => rt.block_on(run_workflow(workflow_file, inputs, data_dir)),
    Commands::Validate { workflow_file } => rt.block_on(validate_workflow(workflow_file)),
    Commands::History { workflow, limit } => rt.block_on(show_history(workflow, limit, data_dir)),
  }
}

async fn run_workflow(
  workflow_file: PathBuf,
  inputs_file: Option<PathBuf>,
  data_dir: PathBuf,
) -> Result<()> {
  let workflow = load_workflow(&workflow_file).await?;
  eprintln!("Loaded workflow: {} v{}", workflow.name(), workflow.version());

  let inputs = match inputs_file {
    Some(path) => {
      let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read inputs file: {}", path.display()))?;
      parse_inputs(&text)?
    }
    None => read_inputs_from_stdin()?,
  };

  let store = open_store(&data_dir).await?;
  let engine = Engine::new(store, EngineConfig::default());

  // Ctrl-C requests cooperative cancellation; in-flight steps are
  // interrupted and the run is recorded as cancelled.
  let cancel = CancellationToken::new();
  let interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      eprintln!("cancellation requested");
      interrupt.cancel();
    }
  });

  let run_id = uuid::Uuid::new_v4().to_string();
  let mut events = engine.subscribe(&run_id);
  let printer = tokio::spawn(async move {
    while let Ok(event) = events.recv().await {
      print_event(&event);
    }
  });

  let run = engine
    .execute_with_run_id(&workflow, run_id, inputs, cancel)
    .await
    .context("workflow execution failed")?;
  let _ = printer.await;

  println!("{}", serde_json::to_string_pretty(&run)?);
  match run.status {
    cascade_store::RunStatus::Succeeded => Ok(()),
    other => bail!("run finished with status {other:?}"),
  }
}

async fn validate_workflow(workflow_file: PathBuf) -> Result<()> {
  let text = tokio::fs::read_to_string(&workflow_file)
    .await
    .with_context(|| format!("failed to read workflow file: {}", workflow_file.display()))?;

  match Workflow::parse(&text) {
    Ok(workflow) => {
      println!("{} v{}: ok", workflow.name(), workflow.version());
      Ok(())
    }
    Err(errors) => {
      for error in &errors {
        eprintln!("{error}");
      }
      bail!("{} validation error(s)", errors.len());
    }
  }
}

async fn show_history(workflow: String, limit: u32, data_dir: PathBuf) -> Result<()> {
  let store = open_store(&data_dir).await?;
  let runs = store
    .get_history(&workflow, limit)
    .await
    .context("failed to query history")?;

  if runs.is_empty() {
    eprintln!("no recorded runs for workflow {workflow:?}");
    return Ok(());
  }
  println!("{}", serde_json::to_string_pretty(&runs)?);
  Ok(())
}

async fn load_workflow(path: &PathBuf) -> Result<Workflow> {
  let text = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read workflow file: {}", path.display()))?;

  match Workflow::parse(&text) {
    Ok(workflow) => Ok(workflow),
    Err(errors) => {
      for error in &errors {
        eprintln!("{error}");
      }
      bail!("invalid workflow definition ({} error(s))", errors.len());
    }
  }
}

async fn open_store(data_dir: &PathBuf) -> Result<Arc<SqliteStore>> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
  let store = SqliteStore::open(&data_dir.join("cascade.db"))
    .await
    .context("failed to open history database")?;
  Ok(Arc::new(store))
}

fn read_inputs_from_stdin() -> Result<serde_json::Map<String, serde_json::Value>> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, run with empty inputs
    return Ok(serde_json::Map::new());
  }
  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read inputs from stdin")?;
  if input.trim().is_empty() {
    return Ok(serde_json::Map::new());
  }
  parse_inputs(&input)
}

fn parse_inputs(text: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
  let value: serde_json::Value =
    serde_json::from_str(text).context("inputs are not valid JSON")?;
  match value {
    serde_json::Value::Object(map) => Ok(map),
    other => bail!("inputs must be a JSON object, got {other}"),
  }
}

fn print_event(event: &EngineEvent) {
  match event {
    EngineEvent::RunStarted { workflow, .. } => eprintln!("run started: {workflow}"),
    EngineEvent::StepStarted { step_id, .. } => eprintln!("  {step_id}: started"),
    EngineEvent::StepRetry {
      step_id,
      attempt,
      delay_ms,
      ..
    } => eprintln!("  {step_id}: retrying (attempt {attempt}, after {delay_ms}ms)"),
    EngineEvent::StepSucceeded {
      step_id,
      duration_ms,
      ..
    } => eprintln!("  {step_id}: succeeded in {duration_ms}ms"),
    EngineEvent::StepFailed { step_id, error, .. } => {
      eprintln!("  {step_id}: failed: {error}");
    }
    EngineEvent::StepSkipped {
      step_id, reason, ..
    } => eprintln!("  {step_id}: skipped ({reason})"),
    EngineEvent::RunSucceeded { .. } => eprintln!("run succeeded"),
    EngineEvent::RunFailed { error, .. } => eprintln!("run failed: {error}"),
    EngineEvent::RunCancelled { .. } => eprintln!("run cancelled"),
  }
}
