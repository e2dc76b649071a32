//! The set of threads of one program, driven by the VM lane.
//!
//! A [CpsThreadGroup] is only ever touched from inside a lane task, so its
//! methods take `&mut self` and need no locking. One scheduled run drives every
//! runnable thread until it suspends, finishes, or uses up the chunk budget;
//! threads still runnable afterwards get another turn behind whatever else is
//! queued on the lane.

use crate::context_vars::{ContextRegistry, ContextVariableSet, DefaultEnv};
use crate::continuation::{CodeSource, Continuable, Next, StepCall, Suspension};
use crate::error::{PersistError, StepError};
use crate::execution::CpsFlowExecution;
use crate::program_io::{
  PROGRAM_FORMAT_VERSION, ProgramState, delete_program, encode_program, write_program,
};
use crate::script::{Block, MAIN_SCRIPT, Program};
use crate::step::{PendingBody, StepContext, StepExecution};
use crate::thread::{ActiveStep, CompletionHandler, CpsThread, SavedStep, SavedThread};
use crate::thread_dump::{ThreadDump, ThreadInfo};
use crate::timing::TimingKind;
use crate::types::{
  Action, Closure, CodeRef, ExecutionState, FlowError, FlowNode, NodeKind, Outcome, Value,
};
use crate::vm_executor::VmHandle;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A step some thread is currently suspended in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentStep {
  pub thread_id: u32,
  pub head_id: u32,
  pub node_id: String,
  pub step_name: String,
  pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
  pub id: u32,
  pub head_id: u32,
  pub runnable: bool,
  pub step: Option<String>,
}

/// Code and globals as seen by one thread.
struct ThreadCode<'a> {
  programs: &'a HashMap<String, Arc<Program>>,
  variables: &'a ContextVariableSet,
  registry: &'a ContextRegistry,
}

impl CodeSource for ThreadCode<'_> {
  fn block(&self, code: &CodeRef) -> Option<&Block> {
    self.programs.get(&code.script)?.block(code.block)
  }

  fn global(&self, name: &str) -> Option<Value> {
    self.variables.get(name, self.registry)
  }
}

/// Stand-in for a step that failed to construct; its outcome is already set.
struct Inert;

impl StepExecution for Inert {
  fn start(&mut self, _ctx: &StepContext) -> Result<bool, StepError> {
    Ok(true)
  }
}

/// Queues a scheduled run. The receiver resolves once no thread is runnable,
/// or immediately when the lane is gone.
pub fn schedule_run(lane: &VmHandle) -> oneshot::Receiver<()> {
  let (tx, rx) = oneshot::channel();
  let queued = Instant::now();
  lane.submit(move |g| {
    g.execution.add_timing(TimingKind::RunQueue, queued.elapsed());
    g.run_scheduled(Some(tx));
  });
  rx
}

pub struct CpsThreadGroup {
  execution: CpsFlowExecution,
  lane: VmHandle,
  threads: BTreeMap<u32, CpsThread>,
  /// Last id handed out for threads, exported closures and step contexts.
  iota: u32,
  closures: BTreeMap<u32, Closure>,
  quiet_poll_pending: bool,
  shut_down: bool,
}

impl CpsThreadGroup {
  pub(crate) fn new(execution: CpsFlowExecution, lane: VmHandle) -> Self {
    Self {
      execution,
      lane,
      threads: BTreeMap::new(),
      iota: 0,
      closures: BTreeMap::new(),
      quiet_poll_pending: false,
      shut_down: false,
    }
  }

  fn next_id(&mut self) -> u32 {
    self.iota += 1;
    self.iota
  }

  fn root_variables() -> ContextVariableSet {
    ContextVariableSet::root(BTreeMap::new(), vec![DefaultEnv::NAME.to_string()])
  }

  /// Thread #0, running the main script from the top.
  pub(crate) fn add_main_thread(&mut self, head_id: u32) {
    self.threads.insert(
      0,
      CpsThread {
        id: 0,
        program: Continuable::for_script(MAIN_SCRIPT),
        head_id,
        resume: Some(Outcome::null()),
        step: None,
        variables: Self::root_variables(),
        completion: CompletionHandler::Program,
      },
    );
  }

  /// A thread with no code that ends the program with `error` once run.
  pub(crate) fn add_failing_thread(&mut self, head_id: u32, error: FlowError) {
    self.threads.insert(
      0,
      CpsThread {
        id: 0,
        program: Continuable::failing(),
        head_id,
        resume: Some(Outcome::Abnormal(error)),
        step: None,
        variables: Self::root_variables(),
        completion: CompletionHandler::Program,
      },
    );
  }

  pub fn execution(&self) -> &CpsFlowExecution {
    &self.execution
  }

  pub fn execution_id(&self) -> Uuid {
    self.execution.id()
  }

  pub fn is_shut_down(&self) -> bool {
    self.shut_down
  }

  /// Stops the lane after the current task.
  pub(crate) fn shut_down(&mut self) {
    self.shut_down = true;
  }

  pub(crate) fn fire_listeners(&self) {
    self.execution.fire_listeners();
  }

  fn request_run(&self) {
    let queued = Instant::now();
    self.lane.submit(move |g| {
      g.execution.add_timing(TimingKind::RunQueue, queued.elapsed());
      g.run_scheduled(None);
    });
  }

  /// Ends the execution after an unexpected failure and discards every thread.
  pub(crate) fn croak(&mut self, error: FlowError) {
    self.execution.croak(error);
    self.threads.clear();
    self.cleanup_heap();
    if let Err(e) = delete_program(&self.execution.program_path()) {
      warn!(error = %e, "could not delete program state");
    }
    self.shut_down = true;
  }

  fn cleanup_heap(&mut self) {
    if !self.closures.is_empty() {
      warn!(count = self.closures.len(), "exported closures left at program end");
      self.closures.clear();
    }
  }

  fn any_runnable(&self) -> bool {
    self.threads.values().any(CpsThread::is_runnable)
  }

  /// One scheduled run. `done` is signalled once no thread is runnable or the
  /// program is paused.
  pub(crate) fn run_scheduled(&mut self, done: Option<oneshot::Sender<()>>) {
    let signal = |done: Option<oneshot::Sender<()>>| {
      if let Some(tx) = done {
        let _ = tx.send(());
      }
    };
    if self.shut_down {
      signal(done);
      return;
    }
    let exec = self.execution.clone();
    let quiet = exec.host().quiet_down.load(Ordering::SeqCst);
    if exec.is_paused() || quiet {
      if quiet && !exec.paused_by_quiet_mode().swap(true, Ordering::SeqCst) {
        exec.console().println("Pausing (Preparing for shutdown)");
      }
      self.save_program_if_possible(true);
      if quiet {
        self.schedule_quiet_poll();
      }
      exec.set_state(if self.any_runnable() {
        ExecutionState::Runnable
      } else {
        ExecutionState::Suspended
      });
      signal(done);
      return;
    }
    if exec.paused_by_quiet_mode().swap(false, Ordering::SeqCst) {
      exec.console().println("Resuming (Shutdown was canceled)");
    }

    let still_runnable = self.run_chunk();
    if still_runnable && !self.shut_down {
      self.lane.submit(move |g| g.run_scheduled(done));
      return;
    }
    signal(done);
  }

  /// While quiet-down holds, keep checking whether it was lifted.
  fn schedule_quiet_poll(&mut self) {
    if self.quiet_poll_pending {
      return;
    }
    self.quiet_poll_pending = true;
    let lane = self.lane.clone();
    let poll = self.execution.host().config.quiet_down_poll;
    tokio::spawn(async move {
      tokio::time::sleep(poll).await;
      lane.submit(|g| {
        g.quiet_poll_pending = false;
        g.run_scheduled(None);
      });
    });
  }

  /// Drives every runnable thread once. Returns whether any thread is still runnable.
  #[instrument(level = "trace", skip(self), fields(execution = %self.execution.id()))]
  fn run_chunk(&mut self) -> bool {
    let exec = self.execution.clone();
    let _timer = exec.time(TimingKind::Run);
    exec.set_state(ExecutionState::Running);

    let ids: Vec<u32> = self
      .threads
      .iter()
      .filter(|(_, t)| t.is_runnable())
      .map(|(id, _)| *id)
      .collect();
    let changed = !ids.is_empty();
    let mut ending = false;

    for id in ids {
      let Some(mut t) = self.threads.remove(&id) else {
        continue;
      };
      if !t.is_runnable() {
        self.threads.insert(id, t);
        continue;
      }
      match self.drive(&mut t) {
        None => {
          self.threads.insert(id, t);
        }
        Some(outcome) => {
          debug!(thread = id, failed = outcome.is_failure(), "thread finished");
          if let Outcome::Abnormal(e) = &outcome {
            exec.set_result(e.result());
            exec.add_error_to_head(t.head_id, e);
          }
          if self.finish_thread(t, outcome) {
            ending = true;
            break;
          }
        }
      }
    }

    if ending {
      self.cleanup_heap();
      if let Err(e) = delete_program(&exec.program_path()) {
        warn!(error = %e, "could not delete program state");
      }
      exec.finish();
      self.shut_down = true;
      return false;
    }

    let still_runnable = self.any_runnable();
    exec.set_state(if still_runnable {
      ExecutionState::Runnable
    } else {
      ExecutionState::Suspended
    });
    if changed && !still_runnable {
      exec.set_persisted_clean(None);
      self.save_program_if_possible(false);
    }
    still_runnable
  }

  /// Runs `t` until it suspends or terminates. `Some` is the final outcome.
  fn drive(&mut self, t: &mut CpsThread) -> Option<Outcome> {
    let exec = self.execution.clone();
    let programs = exec.programs();
    let mut budget = exec.host().config.chunk_budget;
    loop {
      let resume = t.resume.take()?;
      if let Some(active) = t.step.take() {
        debug!(thread = t.id, step = %active.name, "thread resumed out from under its step");
        self.unexport(&active.context);
      }
      let next = {
        let code = ThreadCode {
          programs: &programs,
          variables: &t.variables,
          registry: &exec.host().contexts,
        };
        t.program.run0(resume, &code, &mut budget)
      };
      match next {
        Next::Value(v) => return Some(Outcome::Normal(v)),
        Next::Abnormal(e) => return Some(Outcome::Abnormal(e)),
        Next::Suspended(Suspension::Safepoint) => {
          t.resume(Outcome::null());
          return None;
        }
        Next::Suspended(Suspension::Step(call)) => self.start_step(t, call),
      }
    }
  }

  /// Replaces closures in `value` with exported body ids.
  fn export_closures(&mut self, value: &mut Value, out: &mut Vec<u32>) {
    match value {
      Value::Closure(c) => {
        let id = self.next_id();
        self.closures.insert(id, c.clone());
        out.push(id);
        *value = Value::Body(id);
      }
      Value::List(items) => {
        for v in items {
          self.export_closures(v, out);
        }
      }
      Value::Map(m) => {
        for v in m.values_mut() {
          self.export_closures(v, out);
        }
      }
      _ => {}
    }
  }

  fn unexport(&mut self, ctx: &StepContext) {
    for id in ctx.exported() {
      self.closures.remove(&id);
    }
  }

  fn start_step(&mut self, t: &mut CpsThread, call: StepCall) {
    let exec = self.execution.clone();
    let StepCall { name, mut args, line } = call;
    let Some(step) = exec.host().steps.get(&name).cloned() else {
      let known = exec.host().steps.names().join(", ");
      t.resume(Outcome::Abnormal(FlowError::error(format!(
        "No such DSL method '{}' found among steps [{}]",
        name, known
      ))));
      return;
    };

    let mut exported = Vec::new();
    for v in args.values_mut() {
      self.export_closures(v, &mut exported);
    }
    let block = step.takes_body();
    let kind = if block {
      NodeKind::BlockStart {
        function: name.clone(),
      }
    } else {
      NodeKind::Atom {
        function: name.clone(),
      }
    };
    let parents = exec.head(t.head_id).map(|h| vec![h.node_id]).unwrap_or_default();
    let mut node = FlowNode::new(exec.next_node_id(), kind, parents)
      .with_action(Action::Arguments {
        summary: args.summary(),
      })
      .with_action(Action::Timing {
        started_at: Utc::now(),
      });
    if let Some(label) = step.label(&args) {
      node = node.with_action(Action::Label { label });
    }
    let node_id = node.id.clone();
    if let Err(e) = exec.set_new_head(t.head_id, node) {
      warn!(step = %name, error = %e, "could not record step node");
      for id in exported {
        self.closures.remove(&id);
      }
      t.resume(Outcome::Abnormal(FlowError::internal(format!(
        "could not record node for {}: {}",
        name, e
      ))));
      return;
    }
    debug!(thread = t.id, step = %name, node_id = %node_id, line, "starting step");

    let ctx = StepContext::new(
      self.next_id(),
      t.id,
      node_id.clone(),
      name.clone(),
      self.lane.clone(),
      exec.clone(),
      t.variables.clone(),
    );
    for id in exported {
      ctx.add_exported(id);
    }
    ctx.enter_sync();
    let execution: Box<dyn StepExecution> = match step.create(args) {
      Ok(mut e) => {
        match e.start(&ctx) {
          Ok(true) if !ctx.is_completed() => {
            ctx.on_failure(FlowError::internal(format!(
              "{} reported completion without an outcome",
              name
            )));
          }
          Ok(_) => {}
          Err(err) => {
            ctx.on_failure(FlowError::error(err.to_string()));
          }
        }
        e
      }
      Err(err) => {
        ctx.on_failure(FlowError::error(err.to_string()));
        Box::new(Inert)
      }
    };
    t.step = Some(ActiveStep {
      name,
      node_id,
      block,
      context: ctx,
      execution,
    });
    self.after_step(t);
  }

  /// Picks up whatever the step of `t` signalled: bodies to launch, an outcome to deliver.
  fn after_step(&mut self, t: &mut CpsThread) {
    let Some(active) = t.step.as_ref() else {
      return;
    };
    let ctx = active.context.clone();
    let (bodies, has_outcome) = ctx.exit_sync();
    if !bodies.is_empty() {
      self.launch_bodies(t, &ctx, bodies);
    }
    if has_outcome {
      self.end_step(t);
    }
  }

  fn launch_bodies(&mut self, t: &CpsThread, ctx: &StepContext, bodies: Vec<PendingBody>) {
    let exec = self.execution.clone();
    for PendingBody { body, options } in bodies {
      let head_id = if ctx.body_heads().is_empty() {
        t.head_id
      } else {
        exec.new_head_at(ctx.node_id())
      };
      ctx.add_body_head(head_id);

      let mut branch_start = None;
      if let Some(label) = &options.label {
        let parents = exec.head(head_id).map(|h| vec![h.node_id]).unwrap_or_default();
        let node = FlowNode::new(
          exec.next_node_id(),
          NodeKind::BlockStart {
            function: ctx.step_name().to_string(),
          },
          parents,
        )
        .with_action(Action::Label {
          label: label.clone(),
        })
        .with_action(Action::Timing {
          started_at: Utc::now(),
        });
        let id = node.id.clone();
        match exec.set_new_head(head_id, node) {
          Ok(()) => branch_start = Some(id),
          Err(e) => warn!(label = %label, error = %e, "could not record branch start"),
        }
      }

      let closure = match &body {
        Value::Body(id) => self.closures.get(id).cloned(),
        Value::Closure(c) => Some(c.clone()),
        _ => None,
      };
      let (program, resume) = match closure {
        Some(c) => (Continuable::from_closure(&c, options.args), Outcome::null()),
        None => (
          Continuable::failing(),
          Outcome::Abnormal(FlowError::internal(format!(
            "{} is not a body",
            body.type_name()
          ))),
        ),
      };
      let variables = if options.context.is_empty() {
        ctx.variables().clone()
      } else {
        ctx.variables().with(options.context, Vec::new())
      };
      let id = self.next_id();
      debug!(thread = id, parent = t.id, head = head_id, "launching body");
      self.threads.insert(
        id,
        CpsThread {
          id,
          program,
          head_id,
          resume: Some(resume),
          step: None,
          variables,
          completion: CompletionHandler::Body {
            step_thread: t.id,
            context_id: ctx.id(),
            label: options.label,
            branch_start,
          },
        },
      );
    }
  }

  /// Delivers the step's outcome to `t`, closing its block if it has one.
  fn end_step(&mut self, t: &mut CpsThread) {
    let Some(active) = t.step.take() else {
      return;
    };
    let Some(outcome) = active.context.consume() else {
      t.step = Some(active);
      return;
    };
    let exec = self.execution.clone();
    if active.block {
      let heads = active.context.body_heads();
      let parents: Vec<String> = if heads.is_empty() {
        exec.head(t.head_id).map(|h| vec![h.node_id]).unwrap_or_default()
      } else {
        heads.iter().filter_map(|h| exec.head(*h).map(|h| h.node_id)).collect()
      };
      let mut end = FlowNode::new(
        exec.next_node_id(),
        NodeKind::BlockEnd {
          start_id: active.node_id.clone(),
          function: active.name.clone(),
        },
        parents,
      );
      if let Outcome::Abnormal(e) = &outcome {
        end = end.with_action(Action::Error { error: e.clone() });
      }
      for h in heads {
        if h != t.head_id {
          exec.remove_head(h);
        }
      }
      if let Err(e) = exec.set_new_head(t.head_id, end) {
        warn!(step = %active.name, error = %e, "could not record block end");
      }
    } else if let Outcome::Abnormal(e) = &outcome {
      if let Err(err) = exec.add_action(&active.node_id, Action::Error { error: e.clone() }) {
        warn!(step = %active.name, error = %err, "could not record step error");
      }
    }
    debug!(thread = t.id, step = %active.name, failed = outcome.is_failure(), "step completed");
    self.unexport(&active.context);
    t.resume(outcome);
  }

  /// Handles a terminated thread. Returns true when it was the last one.
  fn finish_thread(&mut self, t: CpsThread, outcome: Outcome) -> bool {
    if let CompletionHandler::Body {
      step_thread,
      context_id,
      label,
      branch_start,
    } = &t.completion
    {
      self.complete_body(&t, *step_thread, *context_id, label.as_deref(), branch_start.clone(), outcome.clone());
    }
    if self.threads.is_empty() {
      self.execution.on_program_end(&outcome);
      return true;
    }
    false
  }

  fn complete_body(
    &mut self,
    t: &CpsThread,
    step_thread: u32,
    context_id: u32,
    label: Option<&str>,
    branch_start: Option<String>,
    outcome: Outcome,
  ) {
    let exec = self.execution.clone();
    let Some(mut parent) = self.threads.remove(&step_thread) else {
      debug!(thread = t.id, step_thread, "step thread is gone; body outcome dropped");
      return;
    };
    if let Some(start_id) = branch_start {
      let function = parent.step.as_ref().map(|a| a.name.clone()).unwrap_or_default();
      let parents = exec.head(t.head_id).map(|h| vec![h.node_id]).unwrap_or_default();
      let mut end = FlowNode::new(
        exec.next_node_id(),
        NodeKind::BlockEnd { start_id, function },
        parents,
      );
      if let Outcome::Abnormal(e) = &outcome {
        end = end.with_action(Action::Error { error: e.clone() });
      }
      if let Err(e) = exec.set_new_head(t.head_id, end) {
        warn!(error = %e, "could not record branch end");
      }
    }
    let delivered = match parent.step.as_mut() {
      Some(active) if active.context.id() == context_id => {
        active.context.enter_sync();
        active.execution.on_body_completed(&active.context, label, outcome);
        true
      }
      _ => false,
    };
    if delivered {
      self.after_step(&mut parent);
    } else {
      debug!(step_thread, context_id, "body finished after its step moved on");
    }
    self.threads.insert(step_thread, parent);
  }

  /// A step signalled from outside the lane.
  pub(crate) fn step_signalled(&mut self, thread_id: u32, context_id: u32) {
    let Some(mut t) = self.threads.remove(&thread_id) else {
      debug!(thread = thread_id, context_id, "signal for a thread that is gone");
      return;
    };
    if t.step.as_ref().is_some_and(|a| a.context.id() == context_id) {
      self.after_step(&mut t);
    }
    let runnable = t.is_runnable();
    self.threads.insert(thread_id, t);
    if runnable || self.any_runnable() {
      self.request_run();
    }
  }

  fn stop_thread(t: &mut CpsThread, cause: FlowError) {
    if t.step.as_ref().is_some_and(|a| a.context.is_completed()) {
      return;
    }
    t.stop(cause);
  }

  /// Stops thread `id` and every body thread below it, innermost first.
  fn stop_subtree(&mut self, id: u32, cause: &FlowError) {
    let children: Vec<u32> = self
      .threads
      .iter()
      .filter(|(_, c)| matches!(c.completion, CompletionHandler::Body { step_thread, .. } if step_thread == id))
      .map(|(cid, _)| *cid)
      .rev()
      .collect();
    for child in children {
      self.stop_subtree(child, cause);
    }
    if let Some(t) = self.threads.get_mut(&id) {
      Self::stop_thread(t, cause.clone());
    }
  }

  /// Stops the bodies launched by step context `context_id`.
  pub(crate) fn cancel_bodies(&mut self, context_id: u32, cause: FlowError) {
    let roots: Vec<u32> = self
      .threads
      .iter()
      .filter(|(_, t)| matches!(t.completion, CompletionHandler::Body { context_id: c, .. } if c == context_id))
      .map(|(id, _)| *id)
      .rev()
      .collect();
    debug!(context_id, bodies = roots.len(), "cancelling bodies");
    for id in roots {
      self.stop_subtree(id, &cause);
    }
    self.request_run();
  }

  /// Stops the youngest thread of each head, youngest first.
  pub(crate) fn interrupt(&mut self, cause: FlowError) {
    let mut youngest: BTreeMap<u32, u32> = BTreeMap::new();
    for (id, t) in &self.threads {
      youngest.insert(t.head_id, *id);
    }
    let mut targets: Vec<u32> = youngest.into_values().collect();
    targets.sort_unstable_by(|a, b| b.cmp(a));
    for id in targets {
      if let Some(t) = self.threads.get_mut(&id) {
        info!(thread = id, cause = %cause, "interrupting thread");
        Self::stop_thread(t, cause.clone());
      }
    }
    self.request_run();
  }

  /// Saves program state when every step is persisted or when pausing.
  fn save_program_if_possible(&mut self, entering_quiet: bool) {
    let exec = self.execution.clone();
    if !(exec.durability().persist_with_every_step() || entering_quiet) {
      return;
    }
    exec.flush_storage();
    let ok = match self.save_program() {
      Ok(()) => true,
      Err(e) => {
        warn!(execution = %exec.id(), error = %e, "program state not saved");
        false
      }
    };
    if entering_quiet {
      exec.set_persisted_clean(Some(ok));
    }
    exec.save_owner();
  }

  /// Writes `program.json`. A value that cannot be pickled fails the most
  /// recent thread with the error.
  pub(crate) fn save_program(&mut self) -> Result<(), PersistError> {
    let exec = self.execution.clone();
    let pickles = &exec.host().pickles;
    if !pickles.has_factories() {
      warn!(execution = %exec.id(), "no pickle factories registered; skipping program save");
      return Ok(());
    }
    let _timer = exec.time(TimingKind::SaveProgram);
    let mut state = self.to_program_state()?;
    let bytes = match encode_program(&mut state, pickles) {
      Ok(b) => b,
      Err(e) => {
        self.propagate_error_to_workflow(&e);
        return Err(e);
      }
    };
    write_program(&exec.program_path(), &bytes, exec.durability().atomic_write())?;
    debug!(execution = %exec.id(), threads = self.threads.len(), "program state saved");
    Ok(())
  }

  fn propagate_error_to_workflow(&mut self, error: &PersistError) {
    let Some(id) = self.threads.keys().next_back().copied() else {
      return;
    };
    let Some(mut t) = self.threads.remove(&id) else {
      return;
    };
    warn!(thread = id, error = %error, "failing thread after program save error");
    let cause = FlowError::error(error.to_string());
    if t.step.as_ref().is_some_and(|a| a.context.is_completed()) {
      // The step already signalled; its outcome is what could not be saved.
      self.end_step(&mut t);
      t.fail(cause);
    } else {
      Self::stop_thread(&mut t, cause);
    }
    self.threads.insert(id, t);
    self.request_run();
  }

  fn to_program_state(&self) -> Result<ProgramState, PersistError> {
    let mut threads = Vec::with_capacity(self.threads.len());
    for t in self.threads.values() {
      let step = match &t.step {
        Some(active) => Some(SavedStep {
          name: active.name.clone(),
          node_id: active.node_id.clone(),
          block: active.block,
          context: active.context.save(),
          state: active.execution.save().map_err(PersistError::Serialize)?,
        }),
        None => None,
      };
      threads.push(SavedThread {
        id: t.id,
        program: t.program.clone(),
        head_id: t.head_id,
        resume: t.resume.clone(),
        step,
        variables: t.variables.to_scopes(),
        completion: t.completion.clone(),
      });
    }
    Ok(ProgramState {
      version: PROGRAM_FORMAT_VERSION,
      iota: self.iota,
      threads,
      closures: self.closures.clone(),
      paused: self.execution.is_paused(),
    })
  }

  /// Rebuilds a group from saved state with live values already resolved.
  pub(crate) fn restore(
    execution: CpsFlowExecution,
    lane: VmHandle,
    state: ProgramState,
  ) -> Result<Self, PersistError> {
    if state.version != PROGRAM_FORMAT_VERSION {
      return Err(PersistError::Rehydrate {
        kind: "program".to_string(),
        message: format!("unsupported format version {}", state.version),
      });
    }
    let mut g = Self::new(execution.clone(), lane.clone());
    g.iota = state.iota;
    g.closures = state.closures;
    for saved in state.threads {
      let variables = ContextVariableSet::from_scopes(saved.variables);
      let step = match saved.step {
        None => None,
        Some(s) => {
          let def = execution.host().steps.get(&s.name).cloned().ok_or_else(|| PersistError::Rehydrate {
            kind: "step".to_string(),
            message: format!("no step named '{}'", s.name),
          })?;
          let step_execution = def.restore(s.state).map_err(|e| PersistError::Rehydrate {
            kind: s.name.clone(),
            message: e.to_string(),
          })?;
          let context = StepContext::restore(
            s.context,
            saved.id,
            s.name.clone(),
            lane.clone(),
            execution.clone(),
            variables.clone(),
          );
          Some(ActiveStep {
            name: s.name,
            node_id: s.node_id,
            block: s.block,
            context,
            execution: step_execution,
          })
        }
      };
      g.threads.insert(
        saved.id,
        CpsThread {
          id: saved.id,
          program: saved.program,
          head_id: saved.head_id,
          resume: saved.resume,
          step,
          variables,
          completion: saved.completion,
        },
      );
    }
    debug!(threads = g.threads.len(), "thread group restored");
    Ok(g)
  }

  /// Lets restored steps reattach, then delivers anything they signalled.
  pub(crate) fn on_loaded(&mut self) {
    let ids: Vec<u32> = self.threads.keys().copied().collect();
    for id in ids {
      let Some(mut t) = self.threads.remove(&id) else {
        continue;
      };
      if let Some(active) = t.step.as_mut() {
        active.context.enter_sync();
        active.execution.on_resume(&active.context);
      }
      self.after_step(&mut t);
      self.threads.insert(id, t);
    }
  }

  pub(crate) fn thread_dump(&self) -> ThreadDump {
    let programs = self.execution.programs();
    let registry = &self.execution.host().contexts;
    let threads = self
      .threads
      .values()
      .map(|t| {
        let mut stack = Vec::new();
        if let Some(active) = &t.step {
          let status = active
            .execution
            .status()
            .unwrap_or_else(|| "Native Method".to_string());
          stack.push(format!("DSL.{}({})", active.name, status));
        }
        let code = ThreadCode {
          programs: &programs,
          variables: &t.variables,
          registry,
        };
        for (script, line) in t.program.stack_trace(&code) {
          stack.push(format!("{}.run({}:{})", script, script, line));
        }
        ThreadInfo {
          headline: format!("Thread #{}", t.id),
          stack,
        }
      })
      .collect();
    ThreadDump { threads }
  }

  pub(crate) fn current_executions(&self, innermost_only: bool) -> Vec<CurrentStep> {
    let threads: Vec<&CpsThread> = if innermost_only {
      let mut by_head: BTreeMap<u32, &CpsThread> = BTreeMap::new();
      for t in self.threads.values() {
        by_head.insert(t.head_id, t);
      }
      let mut v: Vec<&CpsThread> = by_head.into_values().collect();
      v.sort_by_key(|t| t.id);
      v
    } else {
      self.threads.values().collect()
    };
    threads
      .into_iter()
      .filter_map(|t| {
        let active = t.step.as_ref()?;
        Some(CurrentStep {
          thread_id: t.id,
          head_id: t.head_id,
          node_id: active.node_id.clone(),
          step_name: active.name.clone(),
          status: active.execution.status(),
        })
      })
      .collect()
  }

  pub(crate) fn summaries(&self) -> Vec<ThreadSummary> {
    self
      .threads
      .values()
      .map(|t| ThreadSummary {
        id: t.id,
        head_id: t.head_id,
        runnable: t.is_runnable(),
        step: t.step.as_ref().map(|a| a.name.clone()),
      })
      .collect()
  }
}
