//! The step contract between the engine and step implementations.
//!
//! A [Step] describes a DSL function; calling it creates a [StepExecution]
//! that is started with a [StepContext]. The execution either signals its
//! outcome through the context before `start` returns, or returns and signals
//! later from any thread. The context accepts the first signal only.

use crate::console::Console;
use crate::context_vars::ContextVariableSet;
use crate::engine::EngineShared;
use crate::error::StepError;
use crate::execution::CpsFlowExecution;
use crate::types::{Closure, FlowError, Outcome, StepArguments, Value};
use crate::vm_executor::VmHandle;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Descriptor of a DSL function.
pub trait Step: Send + Sync {
  fn name(&self) -> &str;

  /// Block steps get a start and end node and may run bodies.
  fn takes_body(&self) -> bool {
    false
  }

  /// Display label recorded on the step's node.
  fn label(&self, _args: &StepArguments) -> Option<String> {
    None
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError>;

  /// Rebuilds an execution from what [StepExecution::save] returned.
  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError>;
}

/// A running step.
pub trait StepExecution: Send {
  /// Starts the step. Returns true when the outcome was already signalled.
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError>;

  /// Asked to stop early, for example by an interrupt.
  fn stop(&mut self, ctx: &StepContext, cause: FlowError) {
    ctx.on_failure(cause);
  }

  /// Called once after the program was loaded from disk.
  fn on_resume(&mut self, _ctx: &StepContext) {}

  /// A body started through [StepContext::invoke_body] finished.
  fn on_body_completed(&mut self, ctx: &StepContext, _label: Option<&str>, outcome: Outcome) {
    ctx.complete(outcome);
  }

  /// Short description for thread dumps.
  fn status(&self) -> Option<String> {
    None
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    Ok(serde_json::Value::Null)
  }
}

/// How a body is launched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyOptions {
  /// Labelled bodies get their own start and end nodes (parallel branches).
  #[serde(default)]
  pub label: Option<String>,
  /// Context variables overridden for the body.
  #[serde(default)]
  pub context: BTreeMap<String, Value>,
  /// Arguments passed to the closure.
  #[serde(default)]
  pub args: Vec<Value>,
}

impl BodyOptions {
  pub fn labelled(label: impl Into<String>) -> Self {
    Self {
      label: Some(label.into()),
      ..Self::default()
    }
  }

  pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
    self.context.insert(key.into(), value);
    self
  }
}

/// A body waiting to be launched by the lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBody {
  pub body: Value,
  #[serde(flatten)]
  pub options: BodyOptions,
}

#[derive(Debug, Default)]
struct ContextState {
  outcome: Option<Outcome>,
  consumed: bool,
  sync_mode: bool,
  pending_bodies: Vec<PendingBody>,
  body_heads: Vec<u32>,
  exported: Vec<u32>,
}

struct ContextInner {
  id: u32,
  thread_id: u32,
  node_id: String,
  step_name: String,
  lane: VmHandle,
  execution: CpsFlowExecution,
  variables: ContextVariableSet,
  state: Mutex<ContextState>,
}

/// Persisted form of a [StepContext].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedContext {
  pub id: u32,
  pub node_id: String,
  #[serde(default)]
  pub outcome: Option<Outcome>,
  #[serde(default)]
  pub pending_bodies: Vec<PendingBody>,
  #[serde(default)]
  pub body_heads: Vec<u32>,
  #[serde(default)]
  pub exported: Vec<u32>,
}

impl SavedContext {
  /// Values a save must pickle: an outcome not yet delivered and everything
  /// carried by bodies not yet launched.
  pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
    let outcome = self.outcome.iter_mut().filter_map(|o| match o {
      Outcome::Normal(v) => Some(v),
      Outcome::Abnormal(_) => None,
    });
    let bodies = self.pending_bodies.iter_mut().flat_map(|b| {
      std::iter::once(&mut b.body)
        .chain(b.options.args.iter_mut())
        .chain(b.options.context.values_mut())
    });
    outcome.chain(bodies)
  }
}

/// Handle a step uses to report back. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct StepContext {
  inner: Arc<ContextInner>,
}

impl fmt::Debug for StepContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StepContext")
      .field("id", &self.inner.id)
      .field("step", &self.inner.step_name)
      .field("thread", &self.inner.thread_id)
      .field("node_id", &self.inner.node_id)
      .finish()
  }
}

impl StepContext {
  pub(crate) fn new(
    id: u32,
    thread_id: u32,
    node_id: String,
    step_name: String,
    lane: VmHandle,
    execution: CpsFlowExecution,
    variables: ContextVariableSet,
  ) -> Self {
    Self {
      inner: Arc::new(ContextInner {
        id,
        thread_id,
        node_id,
        step_name,
        lane,
        execution,
        variables,
        state: Mutex::new(ContextState::default()),
      }),
    }
  }

  pub(crate) fn restore(
    saved: SavedContext,
    thread_id: u32,
    step_name: String,
    lane: VmHandle,
    execution: CpsFlowExecution,
    variables: ContextVariableSet,
  ) -> Self {
    let ctx = Self::new(saved.id, thread_id, saved.node_id, step_name, lane, execution, variables);
    {
      let mut st = ctx.inner.state.lock();
      st.outcome = saved.outcome;
      st.pending_bodies = saved.pending_bodies;
      st.body_heads = saved.body_heads;
      st.exported = saved.exported;
    }
    ctx
  }

  pub(crate) fn save(&self) -> SavedContext {
    let st = self.inner.state.lock();
    SavedContext {
      id: self.inner.id,
      node_id: self.inner.node_id.clone(),
      outcome: if st.consumed { None } else { st.outcome.clone() },
      pending_bodies: st.pending_bodies.clone(),
      body_heads: st.body_heads.clone(),
      exported: st.exported.clone(),
    }
  }

  pub fn id(&self) -> u32 {
    self.inner.id
  }

  pub fn thread_id(&self) -> u32 {
    self.inner.thread_id
  }

  /// Id of the node this step produced (its block start for block steps).
  pub fn node_id(&self) -> &str {
    &self.inner.node_id
  }

  pub fn step_name(&self) -> &str {
    &self.inner.step_name
  }

  pub fn execution(&self) -> &CpsFlowExecution {
    &self.inner.execution
  }

  pub fn host(&self) -> &EngineShared {
    self.inner.execution.host()
  }

  pub fn console(&self) -> &Console {
    self.inner.execution.console()
  }

  pub fn variables(&self) -> &ContextVariableSet {
    &self.inner.variables
  }

  /// Context variable `key` as seen by this step.
  pub fn get(&self, key: &str) -> Option<Value> {
    self.inner.variables.get(key, &self.host().contexts)
  }

  pub fn on_success(&self, value: Value) -> bool {
    self.complete(Outcome::Normal(value))
  }

  pub fn on_failure(&self, error: FlowError) -> bool {
    self.complete(Outcome::Abnormal(error))
  }

  /// Records `outcome` if none was recorded yet. Later signals are logged and
  /// ignored; the return value says whether this one was accepted.
  pub fn complete(&self, outcome: Outcome) -> bool {
    let sync = {
      let mut st = self.inner.state.lock();
      if st.outcome.is_some() || st.consumed {
        warn!(
          step = %self.inner.step_name,
          context = self.inner.id,
          ignored = ?outcome,
          "step already completed; ignoring second signal"
        );
        return false;
      }
      st.outcome = Some(outcome);
      st.sync_mode
    };
    if !sync {
      self.notify_lane();
    }
    true
  }

  pub fn is_completed(&self) -> bool {
    self.inner.state.lock().outcome.is_some()
  }

  /// Schedules `body` (an exported closure or closure value) to run in a new thread.
  pub fn invoke_body(&self, body: Value, options: BodyOptions) {
    let sync = {
      let mut st = self.inner.state.lock();
      st.pending_bodies.push(PendingBody { body, options });
      st.sync_mode
    };
    if !sync {
      self.notify_lane();
    }
  }

  /// Stops every body this step launched that is still running.
  pub fn cancel_bodies(&self, cause: FlowError) {
    let id = self.inner.id;
    let submitted = self.inner.lane.submit(move |g| g.cancel_bodies(id, cause));
    if !submitted {
      debug!(context = id, "lane closed; bodies not cancelled");
    }
  }

  /// Compiles `source` as a new loaded script and returns a closure over its body.
  pub fn load_script(&self, source: &str) -> Result<Closure, StepError> {
    self
      .inner
      .execution
      .register_script(source)
      .map_err(|e| StepError::Failed(e.to_string()))
  }

  fn notify_lane(&self) {
    let (thread_id, id) = (self.inner.thread_id, self.inner.id);
    if !self.inner.lane.submit(move |g| g.step_signalled(thread_id, id)) {
      debug!(context = id, "lane closed; signal dropped");
    }
  }

  pub(crate) fn enter_sync(&self) {
    self.inner.state.lock().sync_mode = true;
  }

  /// Leaves synchronous mode. Returns the bodies to launch and whether an
  /// unconsumed outcome is waiting.
  pub(crate) fn exit_sync(&self) -> (Vec<PendingBody>, bool) {
    let mut st = self.inner.state.lock();
    st.sync_mode = false;
    let bodies = std::mem::take(&mut st.pending_bodies);
    (bodies, st.outcome.is_some() && !st.consumed)
  }

  /// Takes the outcome for delivery to the thread. At most once.
  pub(crate) fn consume(&self) -> Option<Outcome> {
    let mut st = self.inner.state.lock();
    if st.consumed {
      return None;
    }
    let outcome = st.outcome.clone()?;
    st.consumed = true;
    Some(outcome)
  }

  pub(crate) fn add_body_head(&self, head: u32) {
    self.inner.state.lock().body_heads.push(head);
  }

  pub(crate) fn body_heads(&self) -> Vec<u32> {
    self.inner.state.lock().body_heads.clone()
  }

  pub(crate) fn add_exported(&self, closure_id: u32) {
    self.inner.state.lock().exported.push(closure_id);
  }

  pub(crate) fn exported(&self) -> Vec<u32> {
    self.inner.state.lock().exported.clone()
  }
}

/// Steps by function name.
#[derive(Default, Clone)]
pub struct StepRegistry {
  steps: IndexMap<String, Arc<dyn Step>>,
}

impl fmt::Debug for StepRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.steps.keys()).finish()
  }
}

impl StepRegistry {
  pub fn register(&mut self, step: Arc<dyn Step>) {
    self.steps.insert(step.name().to_string(), step);
  }

  pub fn get(&self, name: &str) -> Option<&Arc<dyn Step>> {
    self.steps.get(name)
  }

  pub fn names(&self) -> Vec<&str> {
    self.steps.keys().map(String::as_str).collect()
  }
}
