//! One run of a pipeline script: lifecycle, graph heads, storage and the
//! promise of its thread group.
//!
//! A [CpsFlowExecution] is cheap to clone and safe to share. Everything that
//! touches threads goes through the program's VM lane; the graph, result and
//! flags here sit behind their own locks so readers never wait on a chunk.

use crate::console::Console;
use crate::engine::EngineShared;
use crate::error::{EngineError, PersistError, StorageError};
use crate::execution_io::{ExecutionRecord, load_record, save_record};
use crate::flow_head::{FlowHead, HeadTable, node_id};
use crate::graph::{DepthFirstScanner, GraphScan};
use crate::pickle::{collect_pickles, replace_pickles, resolve_with_retry};
use crate::program_io::{PROGRAM_FILENAME, read_program};
use crate::script::{MAIN_SCRIPT, Program, compile, loaded_script_name};
use crate::storage::{
  COMPLETED_SUFFIX, FALLBACK_SUFFIX, FlowNodeStorage, StorageKind, open, storage_dir,
};
use crate::thread_dump::ThreadDump;
use crate::thread_group::{CpsThreadGroup, CurrentStep, ThreadSummary, schedule_run};
use crate::timing::{TimingKind, Timings};
use crate::types::{
  Action, BuildResult, Closure, CodeRef, ExecutionState, FlowDurabilityHint, FlowError, FlowNode,
  LiveHandle, NodeKind, Outcome,
};
use crate::vm_executor::{VmHandle, spawn_lane};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Options for [crate::Engine::start_with].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
  /// Overrides the engine's default durability.
  pub durability: Option<FlowDurabilityHint>,
  /// Recorded with the run; policy enforcement is up to the host.
  pub sandbox: bool,
}

/// Observer of graph growth. Called on the VM lane after each task, never
/// while engine locks are held.
pub trait GraphListener: Send + Sync {
  fn on_new_head(&self, node: &FlowNode);
}

/// Availability of the thread group.
#[derive(Debug, Clone)]
pub(crate) enum ProgramPromise {
  Pending,
  Ready(VmHandle),
  Failed(String),
}

struct PickleFuture {
  description: String,
  abort: AbortHandle,
  done: Arc<AtomicBool>,
  cancelled: bool,
}

struct StorageSlot {
  kind: StorageKind,
  suffix: String,
  store: Option<Box<dyn FlowNodeStorage>>,
}

struct ScriptCache {
  main: String,
  loaded: IndexMap<String, String>,
  programs: HashMap<String, Arc<Program>>,
}

pub(crate) struct ExecutionInner {
  id: Uuid,
  run_dir: PathBuf,
  host: Arc<EngineShared>,
  sandbox: bool,
  durability: FlowDurabilityHint,
  started_at: DateTime<Utc>,
  result: Mutex<BuildResult>,
  graph: Mutex<HeadTable>,
  storage: Mutex<StorageSlot>,
  iota: AtomicU32,
  scripts: Mutex<ScriptCache>,
  program: watch::Sender<ProgramPromise>,
  state: watch::Sender<ExecutionState>,
  done: AtomicBool,
  completed: watch::Sender<bool>,
  persisted_clean: Mutex<Option<bool>>,
  resume_blocked: AtomicBool,
  paused: AtomicBool,
  paused_by_quiet_mode: AtomicBool,
  pickle_futures: Mutex<Vec<PickleFuture>>,
  listeners: Mutex<Vec<Arc<dyn GraphListener>>>,
  pending_notifications: Mutex<Vec<FlowNode>>,
  timings: Timings,
  console: Console,
  finished_at: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
pub struct CpsFlowExecution {
  inner: Arc<ExecutionInner>,
}

impl std::fmt::Debug for CpsFlowExecution {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CpsFlowExecution")
      .field("id", &self.inner.id)
      .field("run_dir", &self.inner.run_dir)
      .field("state", &self.state())
      .finish()
  }
}

impl CpsFlowExecution {
  fn from_record(host: Arc<EngineShared>, run_dir: &Path, record: ExecutionRecord) -> Self {
    let ExecutionRecord {
      id,
      script,
      loaded_scripts,
      sandbox,
      durability,
      result,
      heads,
      iota,
      done,
      persisted_clean,
      resume_blocked,
      storage_kind,
      storage_suffix,
      started_at,
      finished_at,
      timings,
    } = record;
    let (program, _) = watch::channel(ProgramPromise::Pending);
    let (state, _) = watch::channel(ExecutionState::Initial);
    let (completed, _) = watch::channel(false);
    Self {
      inner: Arc::new(ExecutionInner {
        id,
        run_dir: run_dir.to_path_buf(),
        host,
        sandbox,
        durability,
        started_at,
        result: Mutex::new(result),
        graph: Mutex::new(heads),
        storage: Mutex::new(StorageSlot {
          kind: storage_kind,
          suffix: storage_suffix,
          store: None,
        }),
        iota: AtomicU32::new(iota),
        scripts: Mutex::new(ScriptCache {
          main: script,
          loaded: loaded_scripts,
          programs: HashMap::new(),
        }),
        program,
        state,
        done: AtomicBool::new(done),
        completed,
        persisted_clean: Mutex::new(persisted_clean),
        resume_blocked: AtomicBool::new(resume_blocked),
        paused: AtomicBool::new(false),
        paused_by_quiet_mode: AtomicBool::new(false),
        pickle_futures: Mutex::new(Vec::new()),
        listeners: Mutex::new(Vec::new()),
        pending_notifications: Mutex::new(Vec::new()),
        timings: Timings::from_nanos(timings),
        console: Console::new(run_dir),
        finished_at: Mutex::new(finished_at),
      }),
    }
  }

  /// Starts a new run of `script` in `run_dir`. Must be called inside a Tokio runtime.
  #[instrument(level = "trace", skip(host, script))]
  pub(crate) fn start(
    host: Arc<EngineShared>,
    run_dir: &Path,
    script: &str,
    options: StartOptions,
  ) -> Result<Self, EngineError> {
    let durability = options.durability.unwrap_or(host.config.durability);
    let record = ExecutionRecord {
      id: Uuid::new_v4(),
      script: script.to_string(),
      loaded_scripts: IndexMap::new(),
      sandbox: options.sandbox,
      durability,
      result: BuildResult::Success,
      heads: HeadTable::default(),
      iota: 0,
      done: false,
      persisted_clean: None,
      resume_blocked: false,
      storage_kind: StorageKind::for_durability(durability),
      storage_suffix: String::new(),
      started_at: Utc::now(),
      finished_at: None,
      timings: BTreeMap::new(),
    };
    let exec = Self::from_record(host, run_dir, record);
    std::fs::create_dir_all(run_dir)?;
    exec.compile_scripts()?;
    exec.open_storage();

    let head_id = exec.next_iota();
    let start = FlowNode::new(exec.next_node_id(), NodeKind::FlowStart, vec![])
      .with_action(Action::Timing {
        started_at: Utc::now(),
      });
    exec.new_start_node(head_id, start)?;
    exec.save_owner();

    let (lane, rx) = VmHandle::channel();
    let mut group = CpsThreadGroup::new(exec.clone(), lane.clone());
    group.add_main_thread(head_id);
    exec.inner.program.send_replace(ProgramPromise::Ready(lane.clone()));
    exec.set_state(ExecutionState::Runnable);
    spawn_lane(group, rx);
    info!(execution = %exec.id(), durability = %durability, "execution started");
    drop(schedule_run(&lane));
    Ok(exec)
  }

  /// Loads a run from `run_dir`. Program state is restored in the background;
  /// must be called inside a Tokio runtime.
  #[instrument(level = "trace", skip(host))]
  pub(crate) fn load(host: Arc<EngineShared>, run_dir: &Path) -> Result<Self, EngineError> {
    let record = load_record(run_dir).map_err(EngineError::Record)?;
    let exec = Self::from_record(host, run_dir, record);
    exec.set_state(ExecutionState::Persisted);
    exec.on_load();
    Ok(exec)
  }

  fn on_load(&self) {
    self.set_state(ExecutionState::Preparing);
    if let Err(e) = self.initialize_storage() {
      warn!(execution = %self.id(), error = %e, "flow graph could not be loaded; creating placeholder nodes");
      self.create_placeholder_nodes(FlowError::load_failed(e.to_string()));
    }
    if self.is_complete() {
      debug!(execution = %self.id(), "loaded a completed execution");
      self.set_state(ExecutionState::Complete);
      self.inner.completed.send_replace(true);
      self.fire_listeners();
      return;
    }
    if self.can_resume() {
      self.load_program_async();
    } else {
      self.load_program_failed(FlowError::load_failed(
        "Cannot resume build -- was not cleanly saved when the engine was shut down.",
      ));
    }
  }

  /// Opens storage for a fresh run.
  fn open_storage(&self) {
    let mut slot = self.inner.storage.lock();
    let dir = storage_dir(&self.inner.run_dir, &slot.suffix);
    slot.store = Some(open(slot.kind, dir, self.inner.durability.atomic_write()));
  }

  /// Opens existing storage and checks that every head and start node resolves.
  fn initialize_storage(&self) -> Result<(), StorageError> {
    let (heads, starts) = {
      let g = self.inner.graph.lock();
      (g.node_ids(), g.start_nodes().to_vec())
    };
    let mut slot = self.inner.storage.lock();
    let dir = storage_dir(&self.inner.run_dir, &slot.suffix);
    let mut store = open(slot.kind, dir, self.inner.durability.atomic_write());
    for id in heads.iter().chain(starts.iter()) {
      store.get_node(id)?;
    }
    if heads.is_empty() {
      return Err(StorageError::MissingNode("<no heads>".to_string()));
    }
    slot.store = Some(store);
    Ok(())
  }

  /// Replaces an unloadable graph with a start node and a failed end node in a
  /// fallback directory, leaving the original node files untouched.
  fn create_placeholder_nodes(&self, reason: FlowError) {
    self.inner.done.store(true, Ordering::SeqCst);
    self.set_result(BuildResult::Failure);
    self
      .inner
      .program
      .send_replace(ProgramPromise::Failed(format!("Failed loading heads: {}", reason)));
    info!(execution = %self.id(), "creating placeholder flow nodes");
    {
      let mut slot = self.inner.storage.lock();
      slot.suffix = format!("{}{}", slot.suffix, FALLBACK_SUFFIX);
      slot.kind = StorageKind::for_durability(self.inner.durability);
      let dir = storage_dir(&self.inner.run_dir, &slot.suffix);
      slot.store = Some(open(slot.kind, dir, self.inner.durability.atomic_write()));
    }
    *self.inner.graph.lock() = HeadTable::default();

    let head_id = self.next_iota();
    let start = FlowNode::new(self.next_node_id(), NodeKind::FlowStart, vec![]);
    let start_id = start.id.clone();
    if let Err(e) = self.new_start_node(head_id, start) {
      warn!(error = %e, "could not store placeholder start node");
    }
    let popped = self.inner.graph.lock().pop_start().unwrap_or(start_id.clone());
    let end = FlowNode::new(
      self.next_node_id(),
      NodeKind::FlowEnd {
        start_id: popped,
        result: self.result(),
      },
      vec![start_id],
    )
    .with_action(Action::Placeholder {
      reason: reason.to_string(),
    })
    .with_action(Action::Error { error: reason });
    if let Err(e) = self.set_new_head(head_id, end) {
      warn!(error = %e, "could not store placeholder end node");
    }
    self.flush_storage();
    *self.inner.finished_at.lock() = Some(Utc::now());
    self.save_owner();
  }

  /// Whether program state on disk can be trusted.
  pub fn can_resume(&self) -> bool {
    if self.inner.resume_blocked.load(Ordering::SeqCst) {
      return false;
    }
    match *self.inner.persisted_clean.lock() {
      Some(clean) => clean,
      None => self.inner.durability.persist_with_every_step(),
    }
  }

  /// Prevents this run from resuming after a restart.
  pub fn set_resume_blocked(&self, blocked: bool) {
    self.inner.resume_blocked.store(blocked, Ordering::SeqCst);
    self.save_owner();
  }

  fn load_program_async(&self) {
    let exec = self.clone();
    tokio::spawn(async move {
      let loaded = {
        let _timer = exec.inner.timings.time(TimingKind::Load);
        exec.rehydrate().await
      };
      if let Err(e) = loaded {
        warn!(execution = %exec.id(), error = %e, "failed to load program state");
        exec.abort_pickle_futures();
        exec.load_program_failed(FlowError::load_failed(e.to_string()));
      }
    });
  }

  async fn rehydrate(&self) -> Result<(), PersistError> {
    let mut state = read_program(&self.program_path())?;
    self.compile_scripts().map_err(|e| match e {
      EngineError::Persist(p) => p,
      other => PersistError::Rehydrate {
        kind: "script".to_string(),
        message: other.to_string(),
      },
    })?;

    let host = self.host();
    let mut handles = Vec::new();
    for pickle in collect_pickles(state.values_mut()) {
      let resolver = host.pickles.resolver(&pickle.kind)?;
      let done = Arc::new(AtomicBool::new(false));
      let description = pickle.to_string();
      let (retries, backoff) = (host.config.pickle_retries, host.config.pickle_backoff);
      let flag = done.clone();
      let handle = tokio::spawn(async move {
        let r = resolve_with_retry(resolver, pickle, retries, backoff).await;
        flag.store(true, Ordering::SeqCst);
        r
      });
      self.inner.pickle_futures.lock().push(PickleFuture {
        description,
        abort: handle.abort_handle(),
        done,
        cancelled: false,
      });
      handles.push(handle);
    }
    let resolved: Vec<LiveHandle> = try_join_all(handles.into_iter().map(|h| async move {
      match h.await {
        Ok(r) => r,
        Err(_) => Err(PersistError::Cancelled),
      }
    }))
    .await?;
    self.inner.pickle_futures.lock().clear();
    replace_pickles(state.values_mut(), resolved)?;

    let paused = state.paused;
    let (lane, rx) = VmHandle::channel();
    let group = CpsThreadGroup::restore(self.clone(), lane.clone(), state)?;
    self.inner.paused.store(paused, Ordering::SeqCst);
    self.inner.program.send_replace(ProgramPromise::Ready(lane.clone()));
    self.set_state(ExecutionState::Suspended);
    spawn_lane(group, rx);
    if paused {
      self.console().println("Still paused");
    } else {
      self.console().println(&format!("Ready to run at {}", Utc::now().to_rfc3339()));
    }
    lane.submit(|g| g.on_loaded());
    drop(schedule_run(&lane));
    Ok(())
  }

  /// Surfaces a load failure as an ordinary thread failure so the run completes.
  fn load_program_failed(&self, error: FlowError) {
    let first = self.inner.graph.lock().first();
    let head_id = match first {
      Some(h) => h.id,
      None => {
        let id = self.next_iota();
        let start = FlowNode::new(self.next_node_id(), NodeKind::FlowStart, vec![]);
        if let Err(e) = self.new_start_node(id, start) {
          warn!(error = %e, "could not store start node for failed program");
        }
        id
      }
    };
    let (lane, rx) = VmHandle::channel();
    let mut group = CpsThreadGroup::new(self.clone(), lane.clone());
    group.add_failing_thread(head_id, error);
    self.inner.program.send_replace(ProgramPromise::Ready(lane.clone()));
    self.set_state(ExecutionState::Runnable);
    spawn_lane(group, rx);
    drop(schedule_run(&lane));
  }

  fn abort_pickle_futures(&self) {
    for f in self.inner.pickle_futures.lock().iter_mut() {
      if !f.done.load(Ordering::SeqCst) {
        f.abort.abort();
        f.cancelled = true;
      }
    }
  }

  pub fn id(&self) -> Uuid {
    self.inner.id
  }

  pub fn run_dir(&self) -> &Path {
    &self.inner.run_dir
  }

  pub fn durability(&self) -> FlowDurabilityHint {
    self.inner.durability
  }

  pub fn is_sandbox(&self) -> bool {
    self.inner.sandbox
  }

  pub fn script(&self) -> String {
    self.inner.scripts.lock().main.clone()
  }

  /// Scripts brought in by `load`, by generated name.
  pub fn loaded_scripts(&self) -> IndexMap<String, String> {
    self.inner.scripts.lock().loaded.clone()
  }

  pub fn state(&self) -> ExecutionState {
    *self.inner.state.borrow()
  }

  pub fn result(&self) -> BuildResult {
    *self.inner.result.lock()
  }

  pub fn is_complete(&self) -> bool {
    self.inner.done.load(Ordering::SeqCst)
  }

  pub fn is_paused(&self) -> bool {
    self.inner.paused.load(Ordering::SeqCst)
  }

  pub fn started_at(&self) -> DateTime<Utc> {
    self.inner.started_at
  }

  pub fn finished_at(&self) -> Option<DateTime<Utc>> {
    *self.inner.finished_at.lock()
  }

  pub fn timings(&self) -> BTreeMap<TimingKind, Duration> {
    self.inner.timings.snapshot()
  }

  /// Console output written so far.
  pub fn console_log(&self) -> String {
    self.inner.console.read()
  }

  pub fn current_heads(&self) -> Vec<FlowHead> {
    self.inner.graph.lock().snapshot()
  }

  /// Nodes the current heads point at.
  pub fn current_head_nodes(&self) -> Result<Vec<FlowNode>, StorageError> {
    let ids = self.inner.graph.lock().node_ids();
    ids.iter().map(|id| self.get_node(id)).collect()
  }

  pub fn is_current_head(&self, node_id: &str) -> bool {
    self.inner.graph.lock().is_current_head(node_id)
  }

  pub fn get_node(&self, id: &str) -> Result<FlowNode, StorageError> {
    let mut slot = self.inner.storage.lock();
    let store = slot.store.as_mut().ok_or(StorageError::Unavailable)?;
    store.get_node(id)
  }

  /// Walks the graph from the current heads.
  pub fn scan_graph(&self) -> GraphScan {
    let heads = self.inner.graph.lock().node_ids();
    let mut slot = self.inner.storage.lock();
    match slot.store.as_mut() {
      Some(store) => DepthFirstScanner::new(store.as_mut()).scan(&heads),
      None => GraphScan {
        nodes: Vec::new(),
        errors: vec![StorageError::Unavailable],
      },
    }
  }

  /// Every reachable node in creation order.
  pub fn nodes(&self) -> Vec<FlowNode> {
    self.scan_graph().sorted()
  }

  pub fn add_listener(&self, listener: Arc<dyn GraphListener>) {
    self.inner.listeners.lock().push(listener);
  }

  /// Waits until the thread group is available.
  async fn wait_for_program(&self) -> Result<VmHandle, EngineError> {
    let mut rx = self.inner.program.subscribe();
    let promise = rx
      .wait_for(|p| !matches!(p, ProgramPromise::Pending))
      .await
      .map_err(|_| EngineError::NotLoaded)?
      .clone();
    match promise {
      ProgramPromise::Ready(lane) => Ok(lane),
      ProgramPromise::Failed(msg) => Err(EngineError::LoadFailed(msg)),
      ProgramPromise::Pending => Err(EngineError::NotLoaded),
    }
  }

  fn lane(&self) -> Option<VmHandle> {
    match &*self.inner.program.borrow() {
      ProgramPromise::Ready(lane) => Some(lane.clone()),
      _ => None,
    }
  }

  /// Asks the lane for another run so it re-reads pause and quiet-down flags.
  pub(crate) fn request_schedule(&self) {
    if let Some(lane) = self.lane() {
      drop(schedule_run(&lane));
    }
  }

  /// Pauses or resumes the program. Pausing checkpoints; nothing runs until unpaused.
  #[instrument(level = "trace", skip(self), fields(execution = %self.id()))]
  pub async fn pause(&self, paused: bool) -> Result<(), EngineError> {
    let lane = self.wait_for_program().await?;
    if paused {
      self.inner.paused.store(true, Ordering::SeqCst);
      self.console().println("Pausing");
      let _ = schedule_run(&lane).await;
      self.save_owner();
    } else if self.inner.paused.swap(false, Ordering::SeqCst) {
      self.console().println("Resuming");
      drop(schedule_run(&lane));
    } else {
      warn!(execution = %self.id(), "not paused to begin with");
    }
    Ok(())
  }

  /// Aborts the run: innermost threads are stopped first, pending pickle
  /// resolution is cancelled, and the result is downgraded to `result`.
  #[instrument(level = "trace", skip(self), fields(execution = %self.id()))]
  pub fn interrupt(&self, result: BuildResult, cause: &str) {
    if self.is_complete() {
      return;
    }
    self.set_result(result);
    let error = FlowError::interrupted(result, cause);
    self.abort_pickle_futures();
    match self.lane() {
      Some(lane) => {
        lane.submit(move |g| g.interrupt(error));
      }
      None => {
        let mut rx = self.inner.program.subscribe();
        tokio::spawn(async move {
          let lane = match rx.wait_for(|p| !matches!(p, ProgramPromise::Pending)).await {
            Ok(p) => match &*p {
              ProgramPromise::Ready(lane) => Some(lane.clone()),
              _ => None,
            },
            Err(_) => None,
          };
          if let Some(lane) = lane {
            lane.submit(move |g| g.interrupt(error));
          }
        });
      }
    }
  }

  /// Resolves once no thread is runnable (or the program is gone).
  pub async fn wait_for_suspension(&self) -> Result<(), EngineError> {
    if self.is_complete() {
      return Ok(());
    }
    let lane = self.wait_for_program().await?;
    let _ = schedule_run(&lane).await;
    Ok(())
  }

  /// Resolves with the final result once the run is complete.
  pub async fn wait_for_completion(&self) -> BuildResult {
    let mut rx = self.inner.completed.subscribe();
    let _ = rx.wait_for(|done| *done).await;
    self.result()
  }

  /// Active steps. With `innermost_only`, one per head: the youngest thread's.
  pub async fn get_current_executions(&self, innermost_only: bool) -> Result<Vec<CurrentStep>, EngineError> {
    if self.is_complete() {
      return Ok(Vec::new());
    }
    let lane = self.wait_for_program().await?;
    lane.call(move |g| g.current_executions(innermost_only)).await
  }

  pub async fn threads(&self) -> Result<Vec<ThreadSummary>, EngineError> {
    if self.is_complete() {
      return Ok(Vec::new());
    }
    let lane = self.wait_for_program().await?;
    lane.call(|g| g.summaries()).await
  }

  pub async fn get_thread_dump(&self) -> ThreadDump {
    if self.is_complete() {
      return ThreadDump::default();
    }
    let promise = self.inner.program.borrow().clone();
    match promise {
      ProgramPromise::Pending => {
        let futures = self.inner.pickle_futures.lock();
        if futures.is_empty() {
          return ThreadDump::from_message("Program state is unknown");
        }
        let mut b = String::from("Program is not yet loaded");
        for f in futures.iter() {
          b.push_str("\n\t");
          b.push_str(&f.description);
          if f.cancelled {
            b.push_str(" (cancelled)");
          }
          if f.done.load(Ordering::SeqCst) {
            b.push_str(" (complete)");
          }
        }
        ThreadDump::from_message(b)
      }
      ProgramPromise::Failed(_) => ThreadDump::from_message("Failed to resurrect program state"),
      ProgramPromise::Ready(lane) => lane.call(|g| g.thread_dump()).await.unwrap_or_default(),
    }
  }

  /// Flushes storage and saves program state from the lane. Records whether
  /// the save succeeded so a restart knows if it can resume.
  #[instrument(level = "trace", skip(self), fields(execution = %self.id()))]
  pub async fn checkpoint(&self) -> bool {
    if self.is_complete() {
      return true;
    }
    let Some(lane) = self.lane() else {
      return false;
    };
    self.flush_storage();
    let ok = match lane.call(|g| g.save_program()).await {
      Ok(Ok(())) => true,
      Ok(Err(e)) => {
        warn!(execution = %self.id(), error = %e, "checkpoint failed");
        false
      }
      Err(_) => false,
    };
    *self.inner.persisted_clean.lock() = Some(ok);
    self.save_owner();
    ok
  }

  /// Stops the lane without saving anything, as if the process died.
  pub async fn detach(&self) {
    self.abort_pickle_futures();
    if let Some(lane) = self.lane() {
      let _ = lane.call(|g| g.shut_down()).await;
    }
  }

  // ---- crate-internal operations used by the thread group and steps ----

  pub(crate) fn host(&self) -> &EngineShared {
    &self.inner.host
  }

  pub(crate) fn console(&self) -> &Console {
    &self.inner.console
  }

  pub(crate) fn downgrade(&self) -> Weak<ExecutionInner> {
    Arc::downgrade(&self.inner)
  }

  pub(crate) fn upgrade(weak: &Weak<ExecutionInner>) -> Option<Self> {
    weak.upgrade().map(|inner| Self { inner })
  }

  pub(crate) fn add_timing(&self, kind: TimingKind, elapsed: Duration) {
    self.inner.timings.add(kind, elapsed);
  }

  pub(crate) fn time(&self, kind: TimingKind) -> crate::timing::TimingGuard<'_> {
    self.inner.timings.time(kind)
  }

  pub(crate) fn program_path(&self) -> PathBuf {
    self.inner.run_dir.join(PROGRAM_FILENAME)
  }

  pub(crate) fn paused_by_quiet_mode(&self) -> &AtomicBool {
    &self.inner.paused_by_quiet_mode
  }

  pub(crate) fn set_persisted_clean(&self, clean: Option<bool>) {
    *self.inner.persisted_clean.lock() = clean;
  }

  pub(crate) fn next_iota(&self) -> u32 {
    self.inner.iota.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub(crate) fn next_node_id(&self) -> String {
    node_id(self.next_iota())
  }

  /// Only moves forward; nothing changes once complete.
  pub(crate) fn set_state(&self, state: ExecutionState) {
    self.inner.state.send_if_modified(|current| {
      if *current == ExecutionState::Complete || *current == state {
        return false;
      }
      *current = state;
      true
    });
  }

  /// Combines `result` into the run's result. Never improves it.
  pub(crate) fn set_result(&self, result: BuildResult) {
    let mut r = self.inner.result.lock();
    *r = r.combine(result);
  }

  pub(crate) fn head(&self, id: u32) -> Option<FlowHead> {
    self.inner.graph.lock().get(id)
  }

  fn store(&self) -> Result<parking_lot::MappedMutexGuard<'_, Box<dyn FlowNodeStorage>>, StorageError> {
    let slot = self.inner.storage.lock();
    parking_lot::MutexGuard::try_map(slot, |s| s.store.as_mut()).map_err(|_| StorageError::Unavailable)
  }

  /// Records `node` as the program's start on a new head.
  pub(crate) fn new_start_node(&self, head_id: u32, node: FlowNode) -> Result<(), StorageError> {
    {
      let _timer = self.time(TimingKind::FlowNode);
      let mut store = self.store()?;
      store.store_node(&node, true)?;
      if self.inner.durability.persist_with_every_step() {
        store.autopersist(&node.id)?;
      }
    }
    {
      let mut g = self.inner.graph.lock();
      g.insert(head_id, node.id.clone());
      g.push_start(node.id.clone());
    }
    self.inner.pending_notifications.lock().push(node);
    Ok(())
  }

  /// Advances head `head_id` to `node`. The previous tip and, for durable
  /// runs, the new node are written before the head moves.
  pub(crate) fn set_new_head(&self, head_id: u32, node: FlowNode) -> Result<(), StorageError> {
    let durable = self.inner.durability.persist_with_every_step();
    let old = self.inner.graph.lock().get(head_id).map(|h| h.node_id);
    {
      let _timer = self.time(TimingKind::FlowNode);
      let mut store = self.store()?;
      if durable {
        if let Some(old) = &old {
          store.autopersist(old)?;
        }
      }
      store.store_node(&node, true)?;
      if durable {
        store.autopersist(&node.id)?;
      }
    }
    self.inner.graph.lock().set(head_id, node.id.clone());
    debug!(head = head_id, node_id = %node.id, "new head");
    self.inner.pending_notifications.lock().push(node);
    Ok(())
  }

  /// A new head pointing at `node_id`, for a forked branch.
  pub(crate) fn new_head_at(&self, node_id: &str) -> u32 {
    let id = self.next_iota();
    self.inner.graph.lock().insert(id, node_id.to_string());
    id
  }

  pub(crate) fn remove_head(&self, id: u32) {
    self.inner.graph.lock().remove(id);
  }

  pub(crate) fn add_action(&self, node_id: &str, action: Action) -> Result<(), StorageError> {
    let mut store = self.store()?;
    let mut actions = store.load_actions(node_id)?;
    actions.push(action);
    store.save_actions(node_id, actions)
  }

  /// Marks the node at head `head_id` with `error` unless it already carries one.
  pub(crate) fn add_error_to_head(&self, head_id: u32, error: &FlowError) {
    let Some(head) = self.head(head_id) else {
      return;
    };
    let has_error = self.get_node(&head.node_id).map(|n| n.has_error()).unwrap_or(false);
    if has_error {
      return;
    }
    if let Err(e) = self.add_action(
      &head.node_id,
      Action::Error {
        error: error.clone(),
      },
    ) {
      warn!(node_id = %head.node_id, error = %e, "could not record error action");
    }
  }

  pub(crate) fn flush_storage(&self) {
    let mut slot = self.inner.storage.lock();
    if let Some(store) = slot.store.as_mut() {
      if let Err(e) = store.flush() {
        warn!(execution = %self.id(), error = %e, "flow node storage flush failed");
      }
    }
  }

  fn compile_scripts(&self) -> Result<(), EngineError> {
    let _timer = self.time(TimingKind::Parse);
    let mut cache = self.inner.scripts.lock();
    let main = compile(MAIN_SCRIPT, &cache.main)?;
    let mut programs = HashMap::new();
    programs.insert(MAIN_SCRIPT.to_string(), Arc::new(main));
    for (name, source) in &cache.loaded {
      let p = compile(name, source).map_err(|source| PersistError::Script {
        name: name.clone(),
        source,
      })?;
      programs.insert(name.clone(), Arc::new(p));
    }
    cache.programs = programs;
    Ok(())
  }

  pub(crate) fn programs(&self) -> HashMap<String, Arc<Program>> {
    self.inner.scripts.lock().programs.clone()
  }

  /// Compiles `source` as the next loaded script and returns a closure over its body.
  pub(crate) fn register_script(&self, source: &str) -> Result<Closure, EngineError> {
    let _timer = self.time(TimingKind::Parse);
    let mut cache = self.inner.scripts.lock();
    let name = loaded_script_name(cache.loaded.len() + 1);
    let program = compile(&name, source)?;
    cache.loaded.insert(name.clone(), source.to_string());
    cache.programs.insert(name.clone(), Arc::new(program));
    debug!(script = %name, "loaded script");
    Ok(Closure {
      code: CodeRef::new(name, 0),
      captured: BTreeMap::new(),
    })
  }

  /// Closes the graph: one end node whose parents are all current heads.
  pub(crate) fn on_program_end(&self, outcome: &Outcome) {
    let (heads, start_id) = {
      let mut g = self.inner.graph.lock();
      (g.snapshot(), g.pop_start().unwrap_or_default())
    };
    let parents = heads.iter().map(|h| h.node_id.clone()).collect();
    let mut end = FlowNode::new(
      self.next_node_id(),
      NodeKind::FlowEnd {
        start_id,
        result: self.result(),
      },
      parents,
    );
    if let Outcome::Abnormal(e) = outcome {
      end = end.with_action(Action::Error { error: e.clone() });
    }
    let first = match heads.first() {
      Some(h) => h.id,
      None => self.next_iota(),
    };
    let end_id = end.id.clone();
    if let Err(e) = self.set_new_head(first, end) {
      warn!(execution = %self.id(), error = %e, "could not store end node");
    }
    self.inner.done.store(true, Ordering::SeqCst);
    self.inner.graph.lock().collapse(first, end_id);
    self.flush_storage();
    self.set_persisted_clean(Some(true));
  }

  /// Final bookkeeping once the program has ended.
  pub(crate) fn finish(&self) {
    *self.inner.finished_at.lock() = Some(Utc::now());
    if self.host().config.optimize_storage {
      self.optimize_storage();
    }
    self.save_owner();
    self.set_state(ExecutionState::Complete);
    self.inner.completed.send_replace(true);
    info!(execution = %self.id(), result = %self.result(), "execution completed");
  }

  /// Force-fails the run after an engine-internal failure. Has no effect once complete.
  pub(crate) fn croak(&self, error: FlowError) {
    if self.is_complete() {
      return;
    }
    warn!(execution = %self.id(), error = %error, "croaking execution");
    self.set_result(BuildResult::Failure);
    let no_start = self.inner.graph.lock().start_nodes().is_empty();
    if no_start {
      self.create_placeholder_nodes(error);
    } else {
      self.on_program_end(&Outcome::Abnormal(error));
    }
    self.finish();
  }

  /// Moves a completed run's per-node files into one bulk file.
  fn optimize_storage(&self) {
    let heads = self.inner.graph.lock().node_ids();
    let mut slot = self.inner.storage.lock();
    if slot.kind != StorageKind::Simple {
      return;
    }
    let Some(store) = slot.store.as_mut() else {
      return;
    };
    let scan = DepthFirstScanner::new(store.as_mut()).scan(&heads);
    if !scan.is_complete() {
      warn!(execution = %self.id(), "graph incomplete; keeping per-node storage");
      return;
    }
    let old_dir = store.dir().to_path_buf();
    let suffix = COMPLETED_SUFFIX.to_string();
    let mut bulk = open(
      StorageKind::Bulk,
      storage_dir(&self.inner.run_dir, &suffix),
      true,
    );
    let copied = scan
      .sorted()
      .iter()
      .try_for_each(|n| bulk.store_node(n, false))
      .and_then(|_| bulk.flush());
    if let Err(e) = copied {
      warn!(execution = %self.id(), error = %e, "storage optimization failed");
      return;
    }
    slot.kind = StorageKind::Bulk;
    slot.suffix = suffix;
    slot.store = Some(bulk);
    drop(slot);
    if let Err(e) = std::fs::remove_dir_all(&old_dir) {
      debug!(dir = %old_dir.display(), error = %e, "could not remove per-node storage");
    }
  }

  pub(crate) fn record(&self) -> ExecutionRecord {
    let (main, loaded) = {
      let s = self.inner.scripts.lock();
      (s.main.clone(), s.loaded.clone())
    };
    let (kind, suffix) = {
      let s = self.inner.storage.lock();
      (s.kind, s.suffix.clone())
    };
    ExecutionRecord {
      id: self.inner.id,
      script: main,
      loaded_scripts: loaded,
      sandbox: self.inner.sandbox,
      durability: self.inner.durability,
      result: self.result(),
      heads: self.inner.graph.lock().clone(),
      iota: self.inner.iota.load(Ordering::SeqCst),
      done: self.is_complete(),
      persisted_clean: *self.inner.persisted_clean.lock(),
      resume_blocked: self.inner.resume_blocked.load(Ordering::SeqCst),
      storage_kind: kind,
      storage_suffix: suffix,
      started_at: self.inner.started_at,
      finished_at: self.finished_at(),
      timings: self.inner.timings.to_nanos(),
    }
  }

  /// Writes `execution.json`. Failures are logged.
  pub(crate) fn save_owner(&self) {
    if let Err(e) = save_record(&self.inner.run_dir, &self.record()) {
      warn!(execution = %self.id(), error = %e, "could not save execution record");
    }
  }

  /// Delivers queued new-head notifications to listeners.
  pub(crate) fn fire_listeners(&self) {
    let nodes = std::mem::take(&mut *self.inner.pending_notifications.lock());
    if nodes.is_empty() {
      return;
    }
    let listeners = self.inner.listeners.lock().clone();
    for node in &nodes {
      for l in &listeners {
        l.on_new_head(node);
      }
    }
  }
}
