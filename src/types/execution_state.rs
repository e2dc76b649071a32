//! Lifecycle state of a flow execution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a [crate::CpsFlowExecution].
///
/// `Initial | Persisted -> Preparing -> Suspended <-> Runnable -> Running -> Complete`.
/// Only `Running` is unsafe to serialize the thread group in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
  /// Constructed, script not parsed yet.
  Initial,
  /// Known from the on-disk record only.
  Persisted,
  /// Program state is being read and its pickles resolved.
  Preparing,
  /// Program in memory, nothing runnable.
  Suspended,
  /// At least one thread has a pending resume value.
  Runnable,
  /// A chunk is executing on the VM lane.
  Running,
  /// No threads remain.
  Complete,
}

impl ExecutionState {
  pub fn is_terminal(self) -> bool {
    matches!(self, ExecutionState::Complete)
  }
}

impl fmt::Display for ExecutionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ExecutionState::Initial => "INITIAL",
      ExecutionState::Persisted => "PERSISTED",
      ExecutionState::Preparing => "PREPARING",
      ExecutionState::Suspended => "SUSPENDED",
      ExecutionState::Runnable => "RUNNABLE",
      ExecutionState::Running => "RUNNING",
      ExecutionState::Complete => "COMPLETE",
    };
    write!(f, "{}", s)
  }
}
