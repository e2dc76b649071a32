//! Whole graph in one file, written on flush only.

use super::{FlowNodeStorage, StorageKind, read_stored};
use crate::error::StorageError;
use crate::json_io::write_json;
use crate::types::{Action, FlowNode};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

pub const BULK_FILENAME: &str = "flowNodeStore.json";

#[derive(Debug)]
pub struct BulkFlowNodeStorage {
  dir: PathBuf,
  nodes: Option<IndexMap<String, FlowNode>>,
  dirty: bool,
  avoid_atomic_write: bool,
}

impl BulkFlowNodeStorage {
  pub fn new(dir: PathBuf) -> Self {
    Self {
      dir,
      nodes: None,
      dirty: false,
      avoid_atomic_write: false,
    }
  }

  fn file(&self) -> PathBuf {
    self.dir.join(BULK_FILENAME)
  }

  /// The node map, read from disk on first use. A missing file is an empty graph.
  fn nodes(&mut self) -> Result<&mut IndexMap<String, FlowNode>, StorageError> {
    if self.nodes.is_none() {
      let loaded = match read_stored::<IndexMap<String, FlowNode>>(&self.file(), BULK_FILENAME) {
        Ok(m) => m,
        Err(StorageError::MissingNode(_)) => IndexMap::new(),
        Err(e) => return Err(e),
      };
      self.nodes = Some(loaded);
    }
    self.nodes.as_mut().ok_or(StorageError::Unavailable)
  }
}

impl FlowNodeStorage for BulkFlowNodeStorage {
  fn kind(&self) -> StorageKind {
    StorageKind::Bulk
  }

  fn dir(&self) -> &Path {
    &self.dir
  }

  fn get_node(&mut self, id: &str) -> Result<FlowNode, StorageError> {
    self
      .nodes()?
      .get(id)
      .cloned()
      .ok_or_else(|| StorageError::MissingNode(id.to_string()))
  }

  fn store_node(&mut self, node: &FlowNode, _delay_write: bool) -> Result<(), StorageError> {
    self.nodes()?.insert(node.id.clone(), node.clone());
    self.dirty = true;
    Ok(())
  }

  fn save_actions(&mut self, id: &str, actions: Vec<Action>) -> Result<(), StorageError> {
    let node = self
      .nodes()?
      .get_mut(id)
      .ok_or_else(|| StorageError::MissingNode(id.to_string()))?;
    node.actions = actions;
    self.dirty = true;
    Ok(())
  }

  #[instrument(level = "trace", skip(self), fields(dir = %self.dir.display()))]
  fn flush(&mut self) -> Result<(), StorageError> {
    if !self.dirty {
      return Ok(());
    }
    let file = self.file();
    let atomic = !self.avoid_atomic_write;
    if let Some(nodes) = &self.nodes {
      debug!(count = nodes.len(), "writing bulk flow node store");
      write_json(&file, nodes, atomic)?;
    }
    self.dirty = false;
    Ok(())
  }

  fn autopersist(&mut self, _id: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn set_avoid_atomic_write(&mut self, avoid: bool) {
    self.avoid_atomic_write = avoid;
  }

  fn is_persisted_fully(&self) -> bool {
    !self.dirty
  }
}

#[cfg(test)]
mod tests {
  use super::{BULK_FILENAME, BulkFlowNodeStorage};
  use crate::error::StorageError;
  use crate::storage::FlowNodeStorage;
  use crate::types::{FlowNode, NodeKind};

  #[test]
  fn nothing_hits_disk_until_flush() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = BulkFlowNodeStorage::new(dir.path().join("workflow"));
    s.store_node(&FlowNode::new("2", NodeKind::FlowStart, vec![]), false)
      .unwrap();
    s.autopersist("2").unwrap();
    assert!(!s.is_persisted_fully());
    assert!(!dir.path().join("workflow").join(BULK_FILENAME).exists());

    s.flush().unwrap();
    assert!(s.is_persisted_fully());
    let mut reopened = BulkFlowNodeStorage::new(dir.path().join("workflow"));
    assert_eq!(reopened.get_node("2").unwrap().kind, NodeKind::FlowStart);
    assert!(matches!(
      reopened.get_node("9"),
      Err(StorageError::MissingNode(id)) if id == "9"
    ));
  }

  #[test]
  fn corrupt_store_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(BULK_FILENAME), b"[oops").unwrap();
    let mut s = BulkFlowNodeStorage::new(dir.path().to_path_buf());
    assert!(matches!(s.get_node("2"), Err(StorageError::Corrupt { .. })));
  }
}
