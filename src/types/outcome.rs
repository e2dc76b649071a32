//! Outcome of resuming a continuation or completing a step.

use super::{BuildResult, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Abnormal payload carried through the program: what a script `catch` sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowError {
  /// Ordinary failure raised by a step or by the script.
  #[error("{message}")]
  Error { message: String },
  /// Operator or system abort; carries the severity the run should end with.
  #[error("interrupted with {result}")]
  Interrupted {
    result: BuildResult,
    #[serde(default)]
    causes: Vec<String>,
  },
  /// Program state could not be restored.
  #[error("Failed to load build state: {message}")]
  LoadFailed { message: String },
  /// Engine bug or callback crash.
  #[error("internal error: {message}")]
  Internal { message: String },
}

impl FlowError {
  pub fn error(message: impl Into<String>) -> Self {
    FlowError::Error {
      message: message.into(),
    }
  }

  pub fn interrupted(result: BuildResult, cause: impl Into<String>) -> Self {
    FlowError::Interrupted {
      result,
      causes: vec![cause.into()],
    }
  }

  pub fn load_failed(message: impl Into<String>) -> Self {
    FlowError::LoadFailed {
      message: message.into(),
    }
  }

  pub fn internal(message: impl Into<String>) -> Self {
    FlowError::Internal {
      message: message.into(),
    }
  }

  /// Result the run is downgraded to when this error escapes a thread.
  pub fn result(&self) -> BuildResult {
    match self {
      FlowError::Interrupted { result, .. } => *result,
      _ => BuildResult::Failure,
    }
  }

  pub fn kind_name(&self) -> &'static str {
    match self {
      FlowError::Error { .. } => "error",
      FlowError::Interrupted { .. } => "interrupted",
      FlowError::LoadFailed { .. } => "load_failed",
      FlowError::Internal { .. } => "internal",
    }
  }

  /// The value bound to the variable of a `catch (e)` block.
  pub fn to_value(&self) -> Value {
    let mut m = IndexMap::new();
    m.insert("message".to_string(), Value::Str(self.to_string()));
    m.insert("type".to_string(), Value::str(self.kind_name()));
    if let FlowError::Interrupted { result, .. } = self {
      m.insert("result".to_string(), Value::Str(result.to_string()));
    }
    Value::Map(m)
  }
}

/// Normal value or abnormal error. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
  Normal(Value),
  Abnormal(FlowError),
}

impl Outcome {
  pub fn null() -> Self {
    Outcome::Normal(Value::Null)
  }

  pub fn is_failure(&self) -> bool {
    matches!(self, Outcome::Abnormal(_))
  }

  pub fn value(&self) -> Option<&Value> {
    match self {
      Outcome::Normal(v) => Some(v),
      Outcome::Abnormal(_) => None,
    }
  }

  pub fn error(&self) -> Option<&FlowError> {
    match self {
      Outcome::Normal(_) => None,
      Outcome::Abnormal(e) => Some(e),
    }
  }

  pub fn into_result(self) -> Result<Value, FlowError> {
    match self {
      Outcome::Normal(v) => Ok(v),
      Outcome::Abnormal(e) => Err(e),
    }
  }
}

impl From<Result<Value, FlowError>> for Outcome {
  fn from(r: Result<Value, FlowError>) -> Self {
    match r {
      Ok(v) => Outcome::Normal(v),
      Err(e) => Outcome::Abnormal(e),
    }
  }
}
