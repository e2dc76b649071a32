//! Error types for the engine's Rust API.
//!
//! Script-visible failures travel as [crate::types::FlowError] inside an
//! [crate::types::Outcome]; the enums here are what host code sees.

use crate::script::ParseError;
use thiserror::Error;

/// Flow node storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("flow node {0} not found")]
  MissingNode(String),
  #[error("flow node {id} is corrupt: {source}")]
  Corrupt {
    id: String,
    #[source]
    source: serde_json::Error,
  },
  #[error("flow node storage is not initialized")]
  Unavailable,
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// Program-state save/load failures, including pickle resolution.
#[derive(Debug, Error)]
pub enum PersistError {
  #[error("program state I/O: {0}")]
  Io(#[from] std::io::Error),
  #[error("program state is not serializable: {0}")]
  Serialize(#[source] serde_json::Error),
  #[error("program state is corrupt: {0}")]
  Deserialize(#[source] serde_json::Error),
  #[error("no pickle factory can write live resource of kind '{0}'")]
  NoFactory(String),
  #[error("no pickle resolver registered for kind '{0}'")]
  NoResolver(String),
  #[error("could not rehydrate {kind}: {message}")]
  Rehydrate { kind: String, message: String },
  #[error("pickle resolution was cancelled")]
  Cancelled,
  #[error("script '{name}' failed to compile: {source}")]
  Script {
    name: String,
    #[source]
    source: ParseError,
  },
}

/// Step construction or start failures reported by step implementations.
#[derive(Debug, Error)]
pub enum StepError {
  #[error("{step}: {message}")]
  InvalidArguments { step: String, message: String },
  #[error("{0}")]
  Failed(String),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl StepError {
  pub fn invalid(step: &str, message: impl Into<String>) -> Self {
    StepError::InvalidArguments {
      step: step.to_string(),
      message: message.into(),
    }
  }
}

/// Errors returned by [crate::Engine] and [crate::CpsFlowExecution] operations.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("script parse error: {0}")]
  Parse(#[from] ParseError),
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error(transparent)]
  Persist(#[from] PersistError),
  #[error("execution record: {0}")]
  Record(#[source] std::io::Error),
  #[error("program is not loaded")]
  NotLoaded,
  #[error("program failed to load: {0}")]
  LoadFailed(String),
  #[error("VM lane is shut down")]
  Rejected,
  #[error(transparent)]
  Io(#[from] std::io::Error),
}
