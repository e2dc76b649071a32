//! One logical thread of a program.

use crate::context_vars::{ContextVariableSet, Scope};
use crate::continuation::Continuable;
use crate::step::{SavedContext, StepContext, StepExecution};
use crate::types::{FlowError, Outcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// What happens when a thread's continuation terminates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionHandler {
  /// The main program thread.
  #[default]
  Program,
  /// Body of a step running in `step_thread`; reports back to context `context_id`.
  Body {
    step_thread: u32,
    context_id: u32,
    #[serde(default)]
    label: Option<String>,
    /// Branch start node when the body was labelled.
    #[serde(default)]
    branch_start: Option<String>,
  },
}

/// The step a thread is currently suspended in.
pub struct ActiveStep {
  pub name: String,
  pub node_id: String,
  pub block: bool,
  pub context: StepContext,
  pub execution: Box<dyn StepExecution>,
}

impl fmt::Debug for ActiveStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ActiveStep")
      .field("name", &self.name)
      .field("node_id", &self.node_id)
      .field("block", &self.block)
      .finish()
  }
}

#[derive(Debug)]
pub struct CpsThread {
  pub id: u32,
  pub program: Continuable,
  pub head_id: u32,
  /// Pending resume value. A thread is runnable iff this is set.
  pub resume: Option<Outcome>,
  pub step: Option<ActiveStep>,
  pub variables: ContextVariableSet,
  pub completion: CompletionHandler,
}

impl CpsThread {
  pub fn is_runnable(&self) -> bool {
    self.resume.is_some()
  }

  pub fn is_alive(&self) -> bool {
    self.program.is_resumable()
  }

  /// Sets the resume value. A thread is resumed once per suspension, so a
  /// second value is dropped and false returned.
  pub fn resume(&mut self, outcome: Outcome) -> bool {
    if let Some(pending) = &self.resume {
      warn!(thread = self.id, ?pending, ignored = ?outcome, "Already resumed");
      return false;
    }
    self.resume = Some(outcome);
    true
  }

  /// Makes the thread raise `cause` next, in place of any pending resume value.
  pub fn fail(&mut self, cause: FlowError) {
    self.resume = Some(Outcome::Abnormal(cause));
  }

  /// Stops the thread: through its step when it has one, otherwise by
  /// failing it with `cause`.
  pub fn stop(&mut self, cause: FlowError) {
    match self.step.as_mut() {
      Some(active) => active.execution.stop(&active.context, cause),
      None => self.fail(cause),
    }
  }
}

/// Persisted form of an [ActiveStep].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedStep {
  pub name: String,
  pub node_id: String,
  pub block: bool,
  pub context: SavedContext,
  #[serde(default)]
  pub state: serde_json::Value,
}

/// Persisted form of a [CpsThread].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedThread {
  pub id: u32,
  pub program: Continuable,
  pub head_id: u32,
  #[serde(default)]
  pub resume: Option<Outcome>,
  #[serde(default)]
  pub step: Option<SavedStep>,
  #[serde(default)]
  pub variables: Vec<Scope>,
  #[serde(default)]
  pub completion: CompletionHandler,
}
