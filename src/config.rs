//! Engine configuration with environment overrides.
//!
//! | Variable | Field |
//! |---|---|
//! | `CPS_FLOW_DURABILITY` | [EngineConfig::durability] |
//! | `CPS_FLOW_CHUNK_BUDGET` | [EngineConfig::chunk_budget] |
//! | `CPS_FLOW_SHUTDOWN_TIMEOUT_SECS` | [EngineConfig::shutdown_timeout] |
//! | `CPS_FLOW_OPTIMIZE_STORAGE` | [EngineConfig::optimize_storage] |
//! | `CPS_FLOW_PICKLE_RETRIES` | [EngineConfig::pickle_retries] |
//! | `CPS_FLOW_WORKSPACE` | [EngineConfig::workspace] |

use crate::types::FlowDurabilityHint;
use indexmap::IndexMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const ENV_DURABILITY: &str = "CPS_FLOW_DURABILITY";
pub const ENV_CHUNK_BUDGET: &str = "CPS_FLOW_CHUNK_BUDGET";
pub const ENV_SHUTDOWN_TIMEOUT: &str = "CPS_FLOW_SHUTDOWN_TIMEOUT_SECS";
pub const ENV_OPTIMIZE_STORAGE: &str = "CPS_FLOW_OPTIMIZE_STORAGE";
pub const ENV_PICKLE_RETRIES: &str = "CPS_FLOW_PICKLE_RETRIES";
pub const ENV_WORKSPACE: &str = "CPS_FLOW_WORKSPACE";

#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Default durability for new runs.
  pub durability: FlowDurabilityHint,
  /// Interpreter instructions a thread may run before yielding at a safepoint.
  pub chunk_budget: usize,
  /// How long [crate::Engine::suspend_all] waits for programs to checkpoint.
  pub shutdown_timeout: Duration,
  /// Migrate per-node storage into one bulk file when a run completes.
  pub optimize_storage: bool,
  /// Extra attempts for each pickle before a load is declared failed.
  pub pickle_retries: u32,
  /// Base delay between pickle attempts; doubled per attempt with jitter.
  pub pickle_backoff: Duration,
  /// Polling interval while paused by quiet-down.
  pub quiet_down_poll: Duration,
  /// Directory `load` resolves script paths against.
  pub workspace: PathBuf,
  /// Environment visible to every run through the `env` context variable.
  pub default_env: IndexMap<String, String>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      durability: FlowDurabilityHint::MaxSurvivability,
      chunk_budget: 10_000,
      shutdown_timeout: Duration::from_secs(30),
      optimize_storage: true,
      pickle_retries: 3,
      pickle_backoff: Duration::from_millis(50),
      quiet_down_poll: Duration::from_secs(1),
      workspace: PathBuf::from("."),
      default_env: IndexMap::new(),
    }
  }
}

impl EngineConfig {
  /// Defaults with environment overrides applied.
  pub fn from_env() -> Self {
    Self::default().with_env_overrides()
  }

  /// Applies any `CPS_FLOW_*` variables that are set. Invalid values are logged and ignored.
  pub fn with_env_overrides(mut self) -> Self {
    if let Some(v) = read_env(ENV_DURABILITY) {
      self.durability = v;
    }
    if let Some(v) = read_env(ENV_CHUNK_BUDGET) {
      self.chunk_budget = v;
    }
    if let Some(secs) = read_env::<u64>(ENV_SHUTDOWN_TIMEOUT) {
      self.shutdown_timeout = Duration::from_secs(secs);
    }
    if let Some(v) = read_env(ENV_OPTIMIZE_STORAGE) {
      self.optimize_storage = v;
    }
    if let Some(v) = read_env(ENV_PICKLE_RETRIES) {
      self.pickle_retries = v;
    }
    if let Ok(dir) = env::var(ENV_WORKSPACE) {
      self.workspace = PathBuf::from(dir);
    }
    self
  }
}

fn read_env<T>(key: &str) -> Option<T>
where
  T: std::str::FromStr,
  T::Err: std::fmt::Display,
{
  let raw = env::var(key).ok()?;
  match raw.parse::<T>() {
    Ok(v) => Some(v),
    Err(e) => {
      warn!(key, value = %raw, error = %e, "ignoring invalid environment override");
      None
    }
  }
}
