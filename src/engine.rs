//! Host entry point: registries shared by every execution plus start/load.

use crate::config::EngineConfig;
use crate::context_vars::{ContextRegistry, DefaultEnv, DynamicContext};
use crate::error::EngineError;
use crate::execution::{CpsFlowExecution, ExecutionInner, StartOptions};
use crate::pickle::{PickleFactory, PickleRegistry, PickleResolver};
use crate::step::{Step, StepRegistry};
use crate::steps::{LeaseFactory, LeasePool, LeaseResolver, SignalBoard, register_builtins};
use crate::types::Value;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, instrument, warn};

/// State shared by an engine and all of its executions.
pub struct EngineShared {
  pub config: EngineConfig,
  pub steps: StepRegistry,
  pub pickles: PickleRegistry,
  pub contexts: ContextRegistry,
  pub signals: SignalBoard,
  pub leases: Arc<LeasePool>,
  /// While set, programs checkpoint and stop running chunks.
  pub quiet_down: AtomicBool,
  executions: Mutex<Vec<Weak<ExecutionInner>>>,
}

impl std::fmt::Debug for EngineShared {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EngineShared")
      .field("config", &self.config)
      .field("steps", &self.steps)
      .field("pickles", &self.pickles)
      .field("contexts", &self.contexts)
      .finish()
  }
}

pub struct EngineBuilder {
  config: EngineConfig,
  steps: Vec<Arc<dyn Step>>,
  factories: Vec<Arc<dyn PickleFactory>>,
  resolvers: Vec<Arc<dyn PickleResolver>>,
  contexts: Vec<Arc<dyn DynamicContext>>,
  leases: Option<Arc<LeasePool>>,
  clear_factories: bool,
}

impl EngineBuilder {
  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  /// Adds a step, replacing a built-in of the same name.
  pub fn step(mut self, step: Arc<dyn Step>) -> Self {
    self.steps.push(step);
    self
  }

  pub fn pickle_factory(mut self, factory: Arc<dyn PickleFactory>) -> Self {
    self.factories.push(factory);
    self
  }

  pub fn pickle_resolver(mut self, resolver: Arc<dyn PickleResolver>) -> Self {
    self.resolvers.push(resolver);
    self
  }

  pub fn context(mut self, provider: Arc<dyn DynamicContext>) -> Self {
    self.contexts.push(provider);
    self
  }

  /// Shares a lease pool, for example between an engine and its successor.
  pub fn leases(mut self, pool: Arc<LeasePool>) -> Self {
    self.leases = Some(pool);
    self
  }

  /// Builds without any pickle factory, which disables program saves.
  pub fn clear_pickle_factories(mut self) -> Self {
    self.clear_factories = true;
    self
  }

  pub fn build(self) -> Engine {
    let leases = self.leases.unwrap_or_default();

    let mut steps = StepRegistry::default();
    register_builtins(&mut steps);
    for s in self.steps {
      steps.register(s);
    }

    let mut pickles = PickleRegistry::default();
    pickles.add_factory(Arc::new(LeaseFactory));
    pickles.add_resolver(Arc::new(LeaseResolver::new(leases.clone())));
    for f in self.factories {
      pickles.add_factory(f);
    }
    for r in self.resolvers {
      pickles.add_resolver(r);
    }
    if self.clear_factories {
      pickles.clear_factories();
    }

    let mut contexts = ContextRegistry::default();
    contexts.register(Arc::new(DefaultEnv::new(self.config.default_env.clone())));
    for c in self.contexts {
      contexts.register(c);
    }

    Engine {
      shared: Arc::new(EngineShared {
        config: self.config,
        steps,
        pickles,
        contexts,
        signals: SignalBoard::default(),
        leases,
        quiet_down: AtomicBool::new(false),
        executions: Mutex::new(Vec::new()),
      }),
    }
  }
}

/// Runs pipeline scripts. Executions need a Tokio runtime.
#[derive(Clone, Debug)]
pub struct Engine {
  shared: Arc<EngineShared>,
}

impl Default for Engine {
  fn default() -> Self {
    Self::builder().build()
  }
}

impl Engine {
  pub fn builder() -> EngineBuilder {
    EngineBuilder {
      config: EngineConfig::default(),
      steps: Vec::new(),
      factories: Vec::new(),
      resolvers: Vec::new(),
      contexts: Vec::new(),
      leases: None,
      clear_factories: false,
    }
  }

  pub fn new(config: EngineConfig) -> Self {
    Self::builder().config(config).build()
  }

  pub fn config(&self) -> &EngineConfig {
    &self.shared.config
  }

  pub fn leases(&self) -> &Arc<LeasePool> {
    &self.shared.leases
  }

  pub fn signals(&self) -> &SignalBoard {
    &self.shared.signals
  }

  /// Starts `script` in `run_dir` with the engine's default durability.
  pub fn start(&self, run_dir: impl AsRef<Path>, script: &str) -> Result<CpsFlowExecution, EngineError> {
    self.start_with(run_dir, script, StartOptions::default())
  }

  #[instrument(level = "trace", skip(self, run_dir, script))]
  pub fn start_with(
    &self,
    run_dir: impl AsRef<Path>,
    script: &str,
    options: StartOptions,
  ) -> Result<CpsFlowExecution, EngineError> {
    let exec = CpsFlowExecution::start(self.shared.clone(), run_dir.as_ref(), script, options)?;
    self.track(&exec);
    Ok(exec)
  }

  /// Loads the run in `run_dir`, resuming it if it was not complete.
  #[instrument(level = "trace", skip(self, run_dir))]
  pub fn load(&self, run_dir: impl AsRef<Path>) -> Result<CpsFlowExecution, EngineError> {
    let exec = CpsFlowExecution::load(self.shared.clone(), run_dir.as_ref())?;
    self.track(&exec);
    Ok(exec)
  }

  fn track(&self, exec: &CpsFlowExecution) {
    let mut list = self.shared.executions.lock();
    list.retain(|w| w.strong_count() > 0);
    list.push(exec.downgrade());
  }

  /// Executions started or loaded by this engine that are still referenced.
  pub fn executions(&self) -> Vec<CpsFlowExecution> {
    self
      .shared
      .executions
      .lock()
      .iter()
      .filter_map(CpsFlowExecution::upgrade)
      .collect()
  }

  /// Fires signal `name`. Returns how many steps were waiting for it.
  pub fn signal(&self, name: &str, value: Value) -> usize {
    self.shared.signals.fire(name, value)
  }

  /// Enters or leaves quiet-down. Entering checkpoints every running program.
  pub fn set_quiet_down(&self, on: bool) {
    let was = self.shared.quiet_down.swap(on, Ordering::SeqCst);
    if was == on {
      return;
    }
    info!(quiet_down = on, "quiet-down changed");
    for exec in self.executions() {
      if !exec.is_complete() {
        exec.request_schedule();
      }
    }
  }

  pub fn is_quiet_down(&self) -> bool {
    self.shared.quiet_down.load(Ordering::SeqCst)
  }

  /// Checkpoints every live execution, waiting at most the configured
  /// shutdown timeout. Returns false when any checkpoint failed or the wait
  /// timed out.
  #[instrument(level = "trace", skip(self))]
  pub async fn suspend_all(&self) -> bool {
    let executions: Vec<CpsFlowExecution> = self
      .executions()
      .into_iter()
      .filter(|e| !e.is_complete())
      .collect();
    let timeout = self.shared.config.shutdown_timeout;
    let work = async {
      let mut all = true;
      for exec in &executions {
        if !exec.checkpoint().await {
          warn!(execution = %exec.id(), "execution could not be suspended cleanly");
          all = false;
        }
      }
      all
    };
    match tokio::time::timeout(timeout, work).await {
      Ok(all) => all,
      Err(_) => {
        warn!(
          timeout_ms = timeout.as_millis() as u64,
          executions = executions.len(),
          "timed out suspending executions"
        );
        false
      }
    }
  }
}
