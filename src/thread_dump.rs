//! Human-readable view of where each program thread is.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
  pub headline: String,
  /// Innermost first, already formatted (`DSL.sleep(...)`, `WorkflowScript.run(WorkflowScript:3)`).
  pub stack: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDump {
  pub threads: Vec<ThreadInfo>,
}

impl ThreadDump {
  /// A dump holding only a diagnostic message.
  pub fn from_message(message: impl Into<String>) -> Self {
    Self {
      threads: vec![ThreadInfo {
        headline: message.into(),
        stack: Vec::new(),
      }],
    }
  }

  pub fn is_empty(&self) -> bool {
    self.threads.is_empty()
  }
}

impl fmt::Display for ThreadDump {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for t in &self.threads {
      writeln!(f, "{}", t.headline)?;
      for frame in &t.stack {
        writeln!(f, "\tat {}", frame)?;
      }
    }
    Ok(())
  }
}
