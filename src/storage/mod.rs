//! Pluggable flow node storage.
//!
//! [simple::SimpleFlowNodeStorage] keeps one file per node and can persist each
//! node as soon as a head moves past it. [bulk::BulkFlowNodeStorage] keeps the
//! graph in memory and writes it in one file on [FlowNodeStorage::flush]. The
//! run's [FlowDurabilityHint] decides which one a run uses.

pub mod bulk;
pub mod simple;


pub use bulk::BulkFlowNodeStorage;
pub use simple::SimpleFlowNodeStorage;

use crate::error::StorageError;
use crate::types::{Action, FlowDurabilityHint, FlowNode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Storage directory of a running build.
pub const STORAGE_DIR: &str = "workflow";
/// Suffix of the directory a completed build's graph is migrated to.
pub const COMPLETED_SUFFIX: &str = "-completed";
/// Suffix used when the real graph could not be loaded.
pub const FALLBACK_SUFFIX: &str = "-fallback";

pub trait FlowNodeStorage: Send + fmt::Debug {
  fn kind(&self) -> StorageKind;

  fn dir(&self) -> &Path;

  /// Node `id`. Unknown ids are [StorageError::MissingNode], unreadable ones
  /// [StorageError::Corrupt].
  fn get_node(&mut self, id: &str) -> Result<FlowNode, StorageError>;

  /// Records `node`. With `delay_write` the node may stay in memory until
  /// [FlowNodeStorage::autopersist] or [FlowNodeStorage::flush].
  fn store_node(&mut self, node: &FlowNode, delay_write: bool) -> Result<(), StorageError>;

  /// Replaces the actions of an already stored node.
  fn save_actions(&mut self, id: &str, actions: Vec<Action>) -> Result<(), StorageError>;

  fn load_actions(&mut self, id: &str) -> Result<Vec<Action>, StorageError> {
    Ok(self.get_node(id)?.actions)
  }

  /// Writes everything still pending.
  fn flush(&mut self) -> Result<(), StorageError>;

  /// Persists node `id` now if its write was delayed.
  fn autopersist(&mut self, id: &str) -> Result<(), StorageError>;

  fn set_avoid_atomic_write(&mut self, avoid: bool);

  /// True when nothing is waiting to be written.
  fn is_persisted_fully(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
  Simple,
  Bulk,
}

impl StorageKind {
  pub fn for_durability(hint: FlowDurabilityHint) -> Self {
    match hint {
      FlowDurabilityHint::PerformanceOptimized => StorageKind::Bulk,
      _ => StorageKind::Simple,
    }
  }
}

impl fmt::Display for StorageKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StorageKind::Simple => write!(f, "simple"),
      StorageKind::Bulk => write!(f, "bulk"),
    }
  }
}

/// Opens storage of `kind` rooted at `dir`. Existing contents are read lazily.
pub fn open(kind: StorageKind, dir: PathBuf, atomic: bool) -> Box<dyn FlowNodeStorage> {
  match kind {
    StorageKind::Simple => {
      let mut s = SimpleFlowNodeStorage::new(dir);
      s.set_avoid_atomic_write(!atomic);
      Box::new(s)
    }
    StorageKind::Bulk => {
      let mut s = BulkFlowNodeStorage::new(dir);
      s.set_avoid_atomic_write(!atomic);
      Box::new(s)
    }
  }
}

/// `<run_dir>/workflow<suffix>`.
pub fn storage_dir(run_dir: &Path, suffix: &str) -> PathBuf {
  run_dir.join(format!("{}{}", STORAGE_DIR, suffix))
}

fn corrupt(id: &str, source: serde_json::Error) -> StorageError {
  StorageError::Corrupt {
    id: id.to_string(),
    source,
  }
}

/// Reads a JSON file, mapping a missing file to [StorageError::MissingNode].
fn read_stored<T: serde::de::DeserializeOwned>(path: &Path, id: &str) -> Result<T, StorageError> {
  let bytes = match std::fs::read(path) {
    Ok(b) => b,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      return Err(StorageError::MissingNode(id.to_string()));
    }
    Err(e) => return Err(StorageError::Io(e)),
  };
  serde_json::from_slice(&bytes).map_err(|e| corrupt(id, e))
}
