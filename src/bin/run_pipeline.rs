//! CLI: run, resume or inspect a durable pipeline.
//!
//! Usage:
//!   run_pipeline run [OPTIONS] --run-dir DIR <script>
//!   run_pipeline resume --run-dir DIR [--signal NAME[=VALUE]]...
//!   run_pipeline dump --run-dir DIR
//!
//! A `run` that hits `--timeout` (or Ctrl-C) is checkpointed and exits with
//! status 2; `resume` continues it from where it stopped.
//!
//! Set RUST_LOG=cps_flow=trace for TRACE-level span enter/exit and events.

use clap::{Parser, Subcommand};
use cps_flow::{BuildResult, CpsFlowExecution, Engine, EngineConfig, FlowDurabilityHint, StartOptions, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

const SUSPENDED_EXIT: i32 = 2;

/// Run, resume or inspect a durable pipeline.
#[derive(Parser, Debug)]
#[command(name = "run_pipeline")]
#[command(
  after_help = r#"Environment variables (override the matching flags when set):
  CPS_FLOW_DURABILITY             MAX_SURVIVABILITY, SURVIVABLE_NONATOMIC or PERFORMANCE_OPTIMIZED
  CPS_FLOW_CHUNK_BUDGET           Instructions a thread runs before yielding
  CPS_FLOW_SHUTDOWN_TIMEOUT_SECS  How long suspending waits for a checkpoint
  CPS_FLOW_OPTIMIZE_STORAGE       Migrate node storage into one file on completion (true/false)
  CPS_FLOW_PICKLE_RETRIES         Extra attempts to rehydrate each pickled value
  CPS_FLOW_WORKSPACE              Directory `load` resolves paths against (default: script's directory)

Examples:
  run_pipeline run --run-dir /tmp/build-1 Jenkinsfile
  run_pipeline run --run-dir /tmp/build-1 --timeout 5 Jenkinsfile
  run_pipeline resume --run-dir /tmp/build-1 --signal approve=yes"#
)]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Start a new run of a pipeline script.
  Run {
    /// Directory holding the run's graph, program state and log.
    #[arg(long, value_name = "DIR")]
    run_dir: PathBuf,

    /// Durability hint for the run. Overridden by CPS_FLOW_DURABILITY if set.
    #[arg(long, value_name = "HINT")]
    durability: Option<FlowDurabilityHint>,

    /// Suspend the run after this many seconds instead of waiting for it.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Path to the pipeline script
    #[arg(value_name = "script")]
    script: PathBuf,
  },
  /// Load a suspended run and drive it to completion.
  Resume {
    #[arg(long, value_name = "DIR")]
    run_dir: PathBuf,

    /// Fire a signal once the run is loaded. May be repeated.
    #[arg(long = "signal", value_name = "NAME[=VALUE]")]
    signals: Vec<String>,

    /// Suspend again after this many seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
  },
  /// Print a stored run's flow graph and thread dump without running it.
  Dump {
    #[arg(long, value_name = "DIR")]
    run_dir: PathBuf,
  },
}

fn parse_signal(raw: &str) -> (String, Value) {
  match raw.split_once('=') {
    Some((name, value)) => (name.to_string(), Value::str(value)),
    None => (raw.to_string(), Value::Null),
  }
}

fn config_for(durability: Option<FlowDurabilityHint>, workspace: Option<&Path>) -> EngineConfig {
  let mut config = EngineConfig::default();
  if let Some(d) = durability {
    config.durability = d;
  }
  if let Some(w) = workspace {
    config.workspace = w.to_path_buf();
  }
  // Env vars override flags.
  config.with_env_overrides()
}

/// Waits for completion, or suspends the run on timeout or Ctrl-C.
async fn drive(exec: &CpsFlowExecution, timeout: Option<u64>) -> Option<BuildResult> {
  let limit = async {
    match timeout {
      Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
      None => std::future::pending().await,
    }
  };
  tokio::select! {
    result = exec.wait_for_completion() => Some(result),
    _ = limit => {
      info!(execution = %exec.id(), "timeout reached; suspending");
      None
    }
    _ = tokio::signal::ctrl_c() => {
      info!(execution = %exec.id(), "interrupted; suspending");
      None
    }
  }
}

async fn finish(engine: &Engine, exec: &CpsFlowExecution, outcome: Option<BuildResult>) -> ! {
  let result = match outcome {
    Some(r) => r,
    None => {
      let clean = engine.suspend_all().await;
      exec.detach().await;
      if !clean {
        warn!(execution = %exec.id(), "run was not suspended cleanly");
      }
      println!("Pipeline suspended.");
      println!("  Run: {}", exec.run_dir().display());
      println!("  Clean: {}", clean);
      process::exit(SUSPENDED_EXIT);
    }
  };
  print!("{}", exec.console_log());
  info!(execution = %exec.id(), result = %result, "pipeline completed");
  println!("Pipeline completed.");
  println!("  Status: {}", result);
  if result != BuildResult::Success {
    process::exit(1);
  }
  process::exit(0);
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
    .init();

  info!("run_pipeline starting");
  let args = Args::parse();

  match args.command {
    Command::Run {
      run_dir,
      durability,
      timeout,
      script,
    } => {
      let source = match fs::read_to_string(&script) {
        Ok(s) => s,
        Err(e) => {
          eprintln!("Error reading {}: {}", script.display(), e);
          process::exit(1);
        }
      };
      let config = config_for(durability, script.parent());
      info!(durability = %config.durability, run_dir = %run_dir.display(), "options (env or flags)");
      let engine = Engine::new(config);
      let exec = match engine.start_with(&run_dir, &source, StartOptions::default()) {
        Ok(e) => e,
        Err(e) => {
          eprintln!("Pipeline error: {}", e);
          process::exit(1);
        }
      };
      let outcome = drive(&exec, timeout).await;
      finish(&engine, &exec, outcome).await;
    }
    Command::Resume {
      run_dir,
      signals,
      timeout,
    } => {
      let engine = Engine::new(config_for(None, None));
      let exec = match engine.load(&run_dir) {
        Ok(e) => e,
        Err(e) => {
          eprintln!("Error loading {}: {}", run_dir.display(), e);
          process::exit(1);
        }
      };
      for raw in &signals {
        let (name, value) = parse_signal(raw);
        let waiting = engine.signal(&name, value);
        info!(signal = %name, waiting, "signal fired");
      }
      let outcome = drive(&exec, timeout).await;
      finish(&engine, &exec, outcome).await;
    }
    Command::Dump { run_dir } => {
      let engine = Engine::new(config_for(None, None));
      // Quiet-down keeps the loaded program from running any chunk.
      engine.set_quiet_down(true);
      let exec = match engine.load(&run_dir) {
        Ok(e) => e,
        Err(e) => {
          eprintln!("Error loading {}: {}", run_dir.display(), e);
          process::exit(1);
        }
      };
      if let Err(e) = exec.wait_for_suspension().await {
        warn!(error = %e, "program state not available");
      }
      println!("Execution {} ({})", exec.id(), exec.state());
      println!("  Result: {}", exec.result());
      println!("  Durability: {}", exec.durability());
      println!("Flow graph:");
      for node in exec.nodes() {
        let parents = node.parents.join(",");
        println!("  {} [{}] {}", node.id, parents, node.display_name());
      }
      let dump = exec.get_thread_dump().await;
      if !dump.is_empty() {
        println!("Threads:");
        print!("{}", dump);
      }
      exec.detach().await;
    }
  }
}
