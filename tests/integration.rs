//! Integration tests driving the engine through its public API: whole runs,
//! simulated restarts, interrupts and failure containment.

use cps_flow::{
  BuildResult, CpsFlowExecution, Engine, EngineConfig, ExecutionState, FlowDurabilityHint, FlowError, FlowNode,
  GraphListener, LiveHandle, LiveResource, NodeKind, StartOptions, Step, StepArguments, StepContext, StepError,
  StepExecution, Value,
};
use parking_lot::Mutex;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

// ---- test steps ----

/// `probe 'name'`: blocks until stopped; records starts and stop order.
#[derive(Default)]
struct ProbeLog {
  started: AtomicUsize,
  stopped: Mutex<Vec<String>>,
}

struct ProbeStep(Arc<ProbeLog>);

impl Step for ProbeStep {
  fn name(&self) -> &str {
    "probe"
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let name = args.get_str("name", 0).unwrap_or("?").to_string();
    Ok(Box::new(Probe {
      name,
      log: self.0.clone(),
    }))
  }

  fn restore(&self, _state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    Err(StepError::Failed("probe cannot be restored".into()))
  }
}

struct Probe {
  name: String,
  log: Arc<ProbeLog>,
}

impl StepExecution for Probe {
  fn start(&mut self, _ctx: &StepContext) -> Result<bool, StepError> {
    self.log.started.fetch_add(1, Ordering::SeqCst);
    Ok(false)
  }

  fn stop(&mut self, ctx: &StepContext, cause: FlowError) {
    self.log.stopped.lock().push(self.name.clone());
    ctx.on_failure(cause);
  }
}

/// `mark`: counts how often it ran. Also tracks how many marks run at once.
#[derive(Default)]
struct Counter {
  runs: AtomicUsize,
  active: AtomicUsize,
  max_active: AtomicUsize,
}

struct MarkStep(Arc<Counter>);

impl Step for MarkStep {
  fn name(&self) -> &str {
    "mark"
  }

  fn create(&self, _args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(Mark(self.0.clone())))
  }

  fn restore(&self, _state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(Mark(self.0.clone())))
  }
}

struct Mark(Arc<Counter>);

impl StepExecution for Mark {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    let now = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.0.max_active.fetch_max(now, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(2));
    self.0.active.fetch_sub(1, Ordering::SeqCst);
    self.0.runs.fetch_add(1, Ordering::SeqCst);
    ctx.on_success(Value::Null);
    Ok(true)
  }
}

/// `twice`: signals from a spawned task, twice, and records what the context accepted.
struct TwiceStep(Arc<Mutex<Vec<bool>>>);

impl Step for TwiceStep {
  fn name(&self) -> &str {
    "twice"
  }

  fn create(&self, _args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(Twice(self.0.clone())))
  }

  fn restore(&self, _state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(Twice(self.0.clone())))
  }
}

struct Twice(Arc<Mutex<Vec<bool>>>);

impl StepExecution for Twice {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    let ctx = ctx.clone();
    let seen = self.0.clone();
    tokio::spawn(async move {
      let first = ctx.on_success(Value::Int(1));
      let second = ctx.on_success(Value::Int(2));
      let third = ctx.on_failure(FlowError::error("late"));
      seen.lock().extend([first, second, third, ctx.is_completed()]);
    });
    Ok(false)
  }
}

/// `explode`: panics inside the lane.
struct ExplodeStep;

impl Step for ExplodeStep {
  fn name(&self) -> &str {
    "explode"
  }

  fn create(&self, _args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(Explode))
  }

  fn restore(&self, _state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(Explode))
  }
}

struct Explode;

impl StepExecution for Explode {
  fn start(&mut self, _ctx: &StepContext) -> Result<bool, StepError> {
    panic!("callback blew up");
  }
}

/// `block`: holds the lane for a while before succeeding.
struct BlockStep(Arc<AtomicBool>);

impl Step for BlockStep {
  fn name(&self) -> &str {
    "block"
  }

  fn create(&self, _args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(Block(self.0.clone())))
  }

  fn restore(&self, _state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(Block(self.0.clone())))
  }
}

struct Block(Arc<AtomicBool>);

impl StepExecution for Block {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    self.0.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(1500));
    ctx.on_success(Value::Null);
    Ok(true)
  }
}

/// A live value no factory knows how to write.
#[derive(Debug)]
struct Socket;

impl LiveResource for Socket {
  fn kind(&self) -> &'static str {
    "socket"
  }

  fn describe(&self) -> String {
    "socket".into()
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

struct OpenSocketStep;

impl Step for OpenSocketStep {
  fn name(&self) -> &str {
    "openSocket"
  }

  fn create(&self, _args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(OpenSocket))
  }

  fn restore(&self, _state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(OpenSocket))
  }
}

struct OpenSocket;

impl StepExecution for OpenSocket {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    ctx.on_success(Value::Live(LiveHandle::new(Socket)));
    Ok(true)
  }
}

/// Builds the value a step signals.
type MakeValue = Arc<dyn Fn() -> Value + Send + Sync>;

/// A step that signals a live value from a plain OS thread shortly after it
/// starts, so the signal lands while the lane is still busy.
struct LateLiveStep {
  name: &'static str,
  make: MakeValue,
}

impl Step for LateLiveStep {
  fn name(&self) -> &str {
    self.name
  }

  fn create(&self, _args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(LateLive(self.make.clone())))
  }

  fn restore(&self, _state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    Ok(Box::new(LateLive(self.make.clone())))
  }
}

struct LateLive(MakeValue);

impl StepExecution for LateLive {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    let ctx = ctx.clone();
    let make = self.0.clone();
    std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(10));
      ctx.on_success(make());
    });
    Ok(false)
  }
}

#[derive(Default)]
struct EndCounter(AtomicUsize);

impl GraphListener for EndCounter {
  fn on_new_head(&self, node: &FlowNode) {
    if matches!(node.kind, NodeKind::FlowEnd { .. }) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }
}

// ---- helpers ----

async fn complete(exec: &CpsFlowExecution) -> BuildResult {
  tokio::time::timeout(WAIT, exec.wait_for_completion())
    .await
    .expect("run did not complete in time")
}

async fn until_waiting(engine: &Engine, signal: &str) {
  for _ in 0..500 {
    if engine.signals().waiting(signal) > 0 {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("nothing waited for signal {}", signal);
}

async fn until(cond: impl Fn() -> bool) {
  for _ in 0..500 {
    if cond() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("condition not reached");
}

fn kinds(exec: &CpsFlowExecution) -> Vec<String> {
  exec
    .nodes()
    .iter()
    .map(|n| match &n.kind {
      NodeKind::FlowStart => "start".to_string(),
      NodeKind::FlowEnd { .. } => "end".to_string(),
      NodeKind::Atom { function } => format!("atom:{}", function),
      NodeKind::BlockStart { function } => format!("block:{}", function),
      NodeKind::BlockEnd { function, .. } => format!("/block:{}", function),
    })
    .collect()
}

fn display_names(exec: &CpsFlowExecution) -> Vec<String> {
  exec.nodes().iter().map(FlowNode::display_name).collect()
}

fn node_labelled<'a>(nodes: &'a [FlowNode], label: &str) -> &'a FlowNode {
  nodes
    .iter()
    .find(|n| n.label() == Some(label))
    .unwrap_or_else(|| panic!("no node labelled {}", label))
}

fn end_of<'a>(nodes: &'a [FlowNode], start: &FlowNode) -> &'a FlowNode {
  nodes
    .iter()
    .find(|n| matches!(&n.kind, NodeKind::BlockEnd { start_id, .. } if *start_id == start.id))
    .unwrap_or_else(|| panic!("no end for {}", start.id))
}

fn assert_single_terminal_head(exec: &CpsFlowExecution) {
  let heads = exec.current_head_nodes().unwrap();
  assert_eq!(heads.len(), 1, "heads: {:?}", exec.current_heads());
  assert!(heads[0].is_terminal());
}

fn has_program_file(dir: &Path) -> bool {
  dir.join("program.json").exists()
}

// ---- scenarios ----

#[tokio::test]
async fn two_sequential_steps_build_a_linear_graph() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::default();
  let exec = engine.start(dir.path(), "echo 'one'\necho 'two'").unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert_eq!(kinds(&exec), vec!["start", "atom:echo", "atom:echo", "end"]);
  let ids: Vec<String> = exec.nodes().iter().map(|n| n.id.clone()).collect();
  assert_eq!(ids, vec!["2", "3", "4", "5"]);
  assert_eq!(exec.state(), ExecutionState::Complete);
  assert!(exec.console_log().contains("one\ntwo"));
  assert_single_terminal_head(&exec);
  assert!(!has_program_file(dir.path()));
  assert!(dir.path().join("workflow-completed").exists());
}

#[tokio::test]
async fn restart_mid_step_reaches_the_same_graph() {
  let script = "withEnv(['GREETING=hi']) {\n  def v = waitForSignal 'go'\n  def g = envVar 'GREETING'\n  echo \"${g} ${v}\"\n}";

  let reference_dir = tempfile::tempdir().unwrap();
  let reference_engine = Engine::default();
  let reference = reference_engine.start(reference_dir.path(), script).unwrap();
  until_waiting(&reference_engine, "go").await;
  reference_engine.signal("go", Value::str("there"));
  assert_eq!(complete(&reference).await, BuildResult::Success);

  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first.start(dir.path(), script).unwrap();
  until_waiting(&first, "go").await;
  exec.wait_for_suspension().await.unwrap();
  let before = exec.threads().await.unwrap();
  let heads_before = exec.current_heads();
  assert!(has_program_file(dir.path()));
  exec.detach().await;
  drop(exec);

  let second = Engine::default();
  let resumed = second.load(dir.path()).unwrap();
  until_waiting(&second, "go").await;
  assert_eq!(resumed.threads().await.unwrap(), before);
  assert_eq!(resumed.current_heads(), heads_before);
  assert!(resumed.console_log().contains("Ready to run at"));

  second.signal("go", Value::str("there"));
  assert_eq!(complete(&resumed).await, BuildResult::Success);
  assert!(resumed.console_log().contains("hi there"));
  assert_eq!(display_names(&resumed), display_names(&reference));
  assert_single_terminal_head(&resumed);
}

#[tokio::test]
async fn failing_branch_fails_the_run_and_marks_only_its_end() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::default();
  let exec = engine
    .start(dir.path(), "parallel a: { error 'boom' }, b: { echo 'fine' }")
    .unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Failure);
  let nodes = exec.nodes();
  let a = node_labelled(&nodes, "Branch: a");
  let b = node_labelled(&nodes, "Branch: b");
  assert!(end_of(&nodes, a).has_error());
  assert!(!end_of(&nodes, b).has_error());
  assert!(!b.has_error());
  let echo = nodes
    .iter()
    .find(|n| matches!(&n.kind, NodeKind::Atom { function } if function == "echo"))
    .unwrap();
  assert!(!echo.has_error());
  assert!(exec.console_log().contains("fine"));
  assert_single_terminal_head(&exec);
}

#[tokio::test]
async fn paused_program_runs_nothing_until_unpaused() {
  let dir = tempfile::tempdir().unwrap();
  let counter = Arc::new(Counter::default());
  let engine = Engine::builder().step(Arc::new(MarkStep(counter.clone()))).build();
  let exec = engine.start(dir.path(), "waitForSignal 'go'\nmark()").unwrap();
  until_waiting(&engine, "go").await;

  exec.pause(true).await.unwrap();
  assert!(exec.is_paused());
  engine.signal("go", Value::Null);
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(counter.runs.load(Ordering::SeqCst), 0);
  let summaries = exec.threads().await.unwrap();
  assert!(summaries.iter().any(|t| t.runnable));
  assert!(exec.checkpoint().await);
  assert!(exec.console_log().contains("Pausing"));

  exec.pause(false).await.unwrap();
  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert_eq!(counter.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn internal_panic_croaks_exactly_once() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::builder().step(Arc::new(ExplodeStep)).build();
  let ends = Arc::new(EndCounter::default());
  let exec = engine
    .start(dir.path(), "echo 'before'\nexplode()\necho 'after'")
    .unwrap();
  exec.add_listener(ends.clone());

  assert_eq!(complete(&exec).await, BuildResult::Failure);
  assert_eq!(exec.state(), ExecutionState::Complete);
  assert!(exec.threads().await.unwrap().is_empty());
  assert!(!exec.console_log().contains("after"));
  assert!(!has_program_file(dir.path()));
  let end = exec.current_head_nodes().unwrap().remove(0);
  assert!(matches!(end.kind, NodeKind::FlowEnd { .. }));
  assert!(end.error().unwrap().to_string().contains("callback blew up"));
  assert_eq!(ends.0.load(Ordering::SeqCst), 1);
  assert_single_terminal_head(&exec);
}

// ---- properties ----

#[tokio::test]
async fn interrupt_stops_innermost_branches_first() {
  let dir = tempfile::tempdir().unwrap();
  let log = Arc::new(ProbeLog::default());
  let engine = Engine::builder().step(Arc::new(ProbeStep(log.clone()))).build();
  let exec = engine
    .start(
      dir.path(),
      "parallel outer: { parallel a: { probe 'a' }, b: { probe 'b' } }, c: { probe 'c' }",
    )
    .unwrap();
  until(|| log.started.load(Ordering::SeqCst) == 3).await;
  exec.wait_for_suspension().await.unwrap();

  let current = exec.get_current_executions(true).await.unwrap();
  assert_eq!(current.len(), 3);
  assert!(current.iter().all(|s| s.step_name == "probe"));

  exec.interrupt(BuildResult::Aborted, "stopped by test");
  assert_eq!(complete(&exec).await, BuildResult::Aborted);
  assert_eq!(*log.stopped.lock(), vec!["b", "a", "c"]);
  assert_single_terminal_head(&exec);
}

#[tokio::test]
async fn step_context_accepts_one_signal() {
  let dir = tempfile::tempdir().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let engine = Engine::builder().step(Arc::new(TwiceStep(seen.clone()))).build();
  let exec = engine.start(dir.path(), "def x = twice()\necho \"x=${x}\"").unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert_eq!(*seen.lock(), vec![true, false, false, true]);
  assert!(exec.console_log().contains("x=1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_chunk_at_a_time() {
  let dir = tempfile::tempdir().unwrap();
  let counter = Arc::new(Counter::default());
  let engine = Engine::builder().step(Arc::new(MarkStep(counter.clone()))).build();
  let exec = engine
    .start(
      dir.path(),
      "parallel a: { mark()\nmark()\nmark() }, b: { mark()\nmark()\nmark() }, c: { mark()\nmark()\nmark() }",
    )
    .unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert_eq!(counter.runs.load(Ordering::SeqCst), 9);
  assert_eq!(counter.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn try_catch_recovers_and_keeps_success() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::default();
  let exec = engine
    .start(dir.path(), "try {\n  error 'oops'\n} catch (e) {\n  echo \"caught ${e}\"\n}")
    .unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert!(exec.console_log().contains("caught"));
  let failed = exec
    .nodes()
    .into_iter()
    .find(|n| matches!(&n.kind, NodeKind::Atom { function } if function == "error"))
    .unwrap();
  assert!(failed.has_error());
}

#[tokio::test]
async fn unknown_step_fails_with_known_names() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::default();
  let exec = engine.start(dir.path(), "frobnicate 'x'").unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Failure);
  let end = exec.current_head_nodes().unwrap().remove(0);
  let message = end.error().unwrap().to_string();
  assert!(message.contains("No such DSL method 'frobnicate'"), "{}", message);
  assert!(message.contains("echo"));
}

#[tokio::test]
async fn parse_errors_are_reported_before_starting() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::default();
  let err = engine.start(dir.path(), "echo 'unterminated").unwrap_err();
  assert!(err.to_string().contains("parse"));
}

#[tokio::test]
async fn sleep_survives_a_restart() {
  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first
    .start(dir.path(), "sleep time: 300, unit: 'MILLISECONDS'\necho 'awake'")
    .unwrap();
  exec.wait_for_suspension().await.unwrap();
  let current = exec.get_current_executions(false).await.unwrap();
  assert_eq!(current[0].step_name, "sleep");
  assert!(current[0].status.as_deref().unwrap_or("").starts_with("Sleeping for"));
  exec.detach().await;
  drop(exec);

  let second = Engine::default();
  let resumed = second.load(dir.path()).unwrap();
  assert_eq!(complete(&resumed).await, BuildResult::Success);
  assert!(resumed.console_log().contains("awake"));
}

#[tokio::test]
async fn thread_dump_shows_waiting_step() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::default();
  let exec = engine.start(dir.path(), "stage('Deploy') {\n  waitForSignal 'approve'\n}").unwrap();
  until_waiting(&engine, "approve").await;

  let dump = exec.get_thread_dump().await.to_string();
  assert!(dump.contains("Thread #0"), "{}", dump);
  assert!(dump.contains("waitForSignal"), "{}", dump);

  engine.signal("approve", Value::Null);
  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert!(exec.get_thread_dump().await.is_empty());
  assert!(exec.nodes().iter().any(|n| n.label() == Some("Deploy")));
}

// ---- persistence failures ----

#[tokio::test]
async fn no_pickle_factories_skip_saving() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::builder().clear_pickle_factories().build();
  let exec = engine.start(dir.path(), "waitForSignal 'go'").unwrap();
  until_waiting(&engine, "go").await;
  exec.wait_for_suspension().await.unwrap();

  assert!(exec.checkpoint().await);
  assert!(!has_program_file(dir.path()));
  engine.signal("go", Value::Null);
  assert_eq!(complete(&exec).await, BuildResult::Success);
}

#[tokio::test]
async fn unpicklable_value_fails_the_thread() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::builder().step(Arc::new(OpenSocketStep)).build();
  let exec = engine
    .start(dir.path(), "def s = openSocket()\nwaitForSignal 'go'\necho 'unreachable'")
    .unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Failure);
  assert!(!exec.console_log().contains("unreachable"));
  let end = exec.current_head_nodes().unwrap().remove(0);
  let message = end.error().unwrap().to_string();
  assert!(message.contains("socket"), "{}", message);
  assert_eq!(engine.signals().waiting("go"), 0);
}

#[tokio::test]
async fn live_value_signalled_during_a_chunk_is_checkpointed() {
  let dir = tempfile::tempdir().unwrap();
  let pool = Arc::new(cps_flow::steps::LeasePool::new());
  let grab_pool = pool.clone();
  let grab = LateLiveStep {
    name: "grab",
    make: Arc::new(move || Value::Live(LiveHandle::new(grab_pool.acquire("db")))),
  };
  let engine = Engine::builder()
    .leases(pool.clone())
    .step(Arc::new(grab))
    .step(Arc::new(BlockStep(Arc::new(AtomicBool::new(false)))))
    .build();
  let exec = engine
    .start(dir.path(), "parallel a: { def l = grab()\necho 'got' }, b: { block() }")
    .unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert!(exec.console_log().contains("got"));
  assert!(pool.is_held("db"));
  assert_single_terminal_head(&exec);
}

#[tokio::test]
async fn unsavable_signalled_value_fails_its_branch() {
  let dir = tempfile::tempdir().unwrap();
  let grab = LateLiveStep {
    name: "grab",
    make: Arc::new(|| Value::Live(LiveHandle::new(Socket))),
  };
  let engine = Engine::builder()
    .step(Arc::new(grab))
    .step(Arc::new(BlockStep(Arc::new(AtomicBool::new(false)))))
    .build();
  let exec = engine
    .start(dir.path(), "parallel a: { def s = grab()\necho 'unreachable' }, b: { block() }")
    .unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Failure);
  assert!(!exec.console_log().contains("unreachable"));
  let nodes = exec.nodes();
  let a = node_labelled(&nodes, "Branch: a");
  let message = end_of(&nodes, a).error().unwrap().to_string();
  assert!(message.contains("socket"), "{}", message);
  assert!(!end_of(&nodes, node_labelled(&nodes, "Branch: b")).has_error());
}

#[tokio::test]
async fn performance_optimized_crash_cannot_resume() {
  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first
    .start_with(
      dir.path(),
      "waitForSignal 'go'",
      StartOptions {
        durability: Some(FlowDurabilityHint::PerformanceOptimized),
        ..Default::default()
      },
    )
    .unwrap();
  until_waiting(&first, "go").await;
  exec.wait_for_suspension().await.unwrap();
  exec.detach().await;
  drop(exec);

  let second = Engine::default();
  let resumed = second.load(dir.path()).unwrap();
  assert!(!resumed.can_resume());
  assert_eq!(complete(&resumed).await, BuildResult::Failure);
  assert_single_terminal_head(&resumed);
}

#[tokio::test]
async fn performance_optimized_clean_shutdown_resumes() {
  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first
    .start_with(
      dir.path(),
      "waitForSignal 'go'\necho 'done'",
      StartOptions {
        durability: Some(FlowDurabilityHint::PerformanceOptimized),
        ..Default::default()
      },
    )
    .unwrap();
  until_waiting(&first, "go").await;
  assert!(first.suspend_all().await);
  exec.detach().await;
  drop(exec);

  let second = Engine::default();
  let resumed = second.load(dir.path()).unwrap();
  assert!(resumed.can_resume());
  until_waiting(&second, "go").await;
  second.signal("go", Value::Null);
  assert_eq!(complete(&resumed).await, BuildResult::Success);
  assert!(resumed.console_log().contains("done"));
}

#[tokio::test]
async fn lease_is_reattached_after_restart() {
  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first
    .start(dir.path(), "def l = acquire 'db'\nwaitForSignal 'go'\nrelease l")
    .unwrap();
  until_waiting(&first, "go").await;
  exec.wait_for_suspension().await.unwrap();
  exec.detach().await;
  drop(exec);

  let second = Engine::default();
  let resumed = second.load(dir.path()).unwrap();
  until_waiting(&second, "go").await;
  assert!(second.leases().is_held("db"));
  second.signal("go", Value::Null);
  assert_eq!(complete(&resumed).await, BuildResult::Success);
  assert!(!second.leases().is_held("db"));
}

#[tokio::test]
async fn pickle_resolution_failure_fails_the_run() {
  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first
    .start(dir.path(), "def l = acquire 'db'\nwaitForSignal 'go'\nrelease l")
    .unwrap();
  until_waiting(&first, "go").await;
  exec.wait_for_suspension().await.unwrap();
  exec.detach().await;
  drop(exec);

  let pool = Arc::new(cps_flow::steps::LeasePool::new());
  pool.set_offline(true);
  let config = EngineConfig {
    pickle_retries: 1,
    pickle_backoff: Duration::from_millis(1),
    ..Default::default()
  };
  let second = Engine::builder().config(config).leases(pool).build();
  let resumed = second.load(dir.path()).unwrap();

  assert_eq!(complete(&resumed).await, BuildResult::Failure);
  let end = resumed.current_head_nodes().unwrap().remove(0);
  let message = end.error().unwrap().to_string();
  assert!(message.contains("offline"), "{}", message);
  assert_eq!(second.signals().waiting("go"), 0);
}

#[tokio::test]
async fn missing_nodes_produce_placeholders() {
  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first.start(dir.path(), "waitForSignal 'go'").unwrap();
  until_waiting(&first, "go").await;
  exec.wait_for_suspension().await.unwrap();
  exec.detach().await;
  drop(exec);
  std::fs::remove_dir_all(dir.path().join("workflow")).unwrap();

  let second = Engine::default();
  let resumed = second.load(dir.path()).unwrap();
  assert_eq!(complete(&resumed).await, BuildResult::Failure);
  assert!(dir.path().join("workflow-fallback").exists());
  assert_eq!(kinds(&resumed), vec!["start", "end"]);
  assert!(resumed.current_head_nodes().unwrap()[0].has_error());
}

#[tokio::test]
async fn completed_run_loads_without_running() {
  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first.start(dir.path(), "echo 'only once'").unwrap();
  assert_eq!(complete(&exec).await, BuildResult::Success);
  let names = display_names(&exec);
  drop(exec);

  let second = Engine::default();
  let loaded = second.load(dir.path()).unwrap();
  assert!(loaded.is_complete());
  assert_eq!(loaded.result(), BuildResult::Success);
  assert_eq!(display_names(&loaded), names);
  assert_eq!(loaded.console_log().matches("only once").count(), 1);
}

// ---- host operations ----

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn suspend_all_gives_up_after_timeout() {
  let dir = tempfile::tempdir().unwrap();
  let entered = Arc::new(AtomicBool::new(false));
  let config = EngineConfig {
    shutdown_timeout: Duration::from_millis(200),
    ..Default::default()
  };
  let engine = Engine::builder()
    .config(config)
    .step(Arc::new(BlockStep(entered.clone())))
    .build();
  let exec = engine.start(dir.path(), "block()").unwrap();
  until(|| entered.load(Ordering::SeqCst)).await;

  assert!(!engine.suspend_all().await);
  assert_eq!(complete(&exec).await, BuildResult::Success);
}

#[tokio::test]
async fn quiet_down_holds_runs_until_lifted() {
  let dir = tempfile::tempdir().unwrap();
  let counter = Arc::new(Counter::default());
  let config = EngineConfig {
    quiet_down_poll: Duration::from_millis(20),
    ..Default::default()
  };
  let engine = Engine::builder()
    .config(config)
    .step(Arc::new(MarkStep(counter.clone())))
    .build();
  let exec = engine.start(dir.path(), "waitForSignal 'go'\nmark()").unwrap();
  until_waiting(&engine, "go").await;

  engine.set_quiet_down(true);
  engine.signal("go", Value::Null);
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(counter.runs.load(Ordering::SeqCst), 0);
  assert!(exec.console_log().contains("Pausing (Preparing for shutdown)"));
  assert!(has_program_file(dir.path()));

  engine.set_quiet_down(false);
  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert_eq!(counter.runs.load(Ordering::SeqCst), 1);
  assert!(exec.console_log().contains("Resuming (Shutdown was canceled)"));
}

#[tokio::test]
async fn lifting_quiet_down_keeps_a_user_pause() {
  let dir = tempfile::tempdir().unwrap();
  let counter = Arc::new(Counter::default());
  let config = EngineConfig {
    quiet_down_poll: Duration::from_millis(20),
    ..Default::default()
  };
  let engine = Engine::builder()
    .config(config)
    .step(Arc::new(MarkStep(counter.clone())))
    .build();
  let exec = engine.start(dir.path(), "waitForSignal 'go'\nmark()").unwrap();
  until_waiting(&engine, "go").await;

  exec.pause(true).await.unwrap();
  engine.set_quiet_down(true);
  engine.signal("go", Value::Null);
  tokio::time::sleep(Duration::from_millis(100)).await;
  engine.set_quiet_down(false);
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(exec.is_paused());
  assert_eq!(counter.runs.load(Ordering::SeqCst), 0);

  exec.pause(false).await.unwrap();
  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert_eq!(counter.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resume_blocked_run_fails_on_load() {
  let dir = tempfile::tempdir().unwrap();
  let first = Engine::default();
  let exec = first.start(dir.path(), "waitForSignal 'go'").unwrap();
  until_waiting(&first, "go").await;
  exec.wait_for_suspension().await.unwrap();
  exec.set_resume_blocked(true);
  exec.detach().await;
  drop(exec);

  let second = Engine::default();
  let resumed = second.load(dir.path()).unwrap();
  assert_eq!(complete(&resumed).await, BuildResult::Failure);
  let end = resumed.current_head_nodes().unwrap().remove(0);
  assert!(end.error().unwrap().to_string().contains("Cannot resume build"));
}

#[tokio::test]
async fn load_step_runs_workspace_script() {
  let dir = tempfile::tempdir().unwrap();
  let workspace = tempfile::tempdir().unwrap();
  std::fs::write(workspace.path().join("lib.groovy"), "echo 'from library'").unwrap();
  let config = EngineConfig {
    workspace: workspace.path().to_path_buf(),
    ..Default::default()
  };
  let engine = Engine::new(config);
  let exec = engine.start(dir.path(), "load 'lib.groovy'\necho 'back'").unwrap();

  assert_eq!(complete(&exec).await, BuildResult::Success);
  assert!(exec.console_log().contains("from library\nback"));
  assert_eq!(exec.loaded_scripts().len(), 1);
}

#[tokio::test]
async fn interrupt_right_after_start_aborts() {
  let dir = tempfile::tempdir().unwrap();
  let engine = Engine::default();
  let exec = engine.start(dir.path(), "waitForSignal 'never'").unwrap();
  exec.interrupt(BuildResult::Aborted, "early");
  assert_eq!(complete(&exec).await, BuildResult::Aborted);
  assert!(exec.result().is_worse_than(BuildResult::Failure));
}

#[tokio::test]
async fn durability_from_config_applies_to_new_runs() {
  let dir = tempfile::tempdir().unwrap();
  let config = EngineConfig {
    durability: FlowDurabilityHint::SurvivableNonatomic,
    ..Default::default()
  };
  let engine = Engine::new(config);
  let exec = engine.start(dir.path(), "echo 'x'").unwrap();
  assert_eq!(exec.durability(), FlowDurabilityHint::SurvivableNonatomic);
  assert_eq!(complete(&exec).await, BuildResult::Success);
  tokio_test::assert_ok!(exec.get_current_executions(false).await);
}
