//! One JSON file per node: `<dir>/<id>.json`.

use super::{FlowNodeStorage, StorageKind, read_stored};
use crate::error::StorageError;
use crate::json_io::write_json;
use crate::types::{Action, FlowNode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{instrument, trace};

#[derive(Debug)]
struct Entry {
  node: FlowNode,
  dirty: bool,
}

#[derive(Debug)]
pub struct SimpleFlowNodeStorage {
  dir: PathBuf,
  cache: HashMap<String, Entry>,
  avoid_atomic_write: bool,
}

impl SimpleFlowNodeStorage {
  pub fn new(dir: PathBuf) -> Self {
    Self {
      dir,
      cache: HashMap::new(),
      avoid_atomic_write: false,
    }
  }

  fn path_of(&self, id: &str) -> PathBuf {
    self.dir.join(format!("{}.json", id))
  }

  fn write(&self, node: &FlowNode) -> Result<(), StorageError> {
    trace!(node_id = %node.id, "writing flow node");
    write_json(&self.path_of(&node.id), node, !self.avoid_atomic_write)?;
    Ok(())
  }

  fn write_if_dirty(&mut self, id: &str) -> Result<(), StorageError> {
    let Some(entry) = self.cache.get(id) else {
      return Ok(());
    };
    if entry.dirty {
      self.write(&entry.node)?;
      if let Some(entry) = self.cache.get_mut(id) {
        entry.dirty = false;
      }
    }
    Ok(())
  }
}

impl FlowNodeStorage for SimpleFlowNodeStorage {
  fn kind(&self) -> StorageKind {
    StorageKind::Simple
  }

  fn dir(&self) -> &Path {
    &self.dir
  }

  fn get_node(&mut self, id: &str) -> Result<FlowNode, StorageError> {
    if let Some(entry) = self.cache.get(id) {
      return Ok(entry.node.clone());
    }
    let node: FlowNode = read_stored(&self.path_of(id), id)?;
    self.cache.insert(
      id.to_string(),
      Entry {
        node: node.clone(),
        dirty: false,
      },
    );
    Ok(node)
  }

  #[instrument(level = "trace", skip(self, node), fields(node_id = %node.id))]
  fn store_node(&mut self, node: &FlowNode, delay_write: bool) -> Result<(), StorageError> {
    if !delay_write {
      self.write(node)?;
    }
    self.cache.insert(
      node.id.clone(),
      Entry {
        node: node.clone(),
        dirty: delay_write,
      },
    );
    Ok(())
  }

  fn save_actions(&mut self, id: &str, actions: Vec<Action>) -> Result<(), StorageError> {
    let mut node = self.get_node(id)?;
    node.actions = actions;
    self.store_node(&node, false)
  }

  fn flush(&mut self) -> Result<(), StorageError> {
    let dirty: Vec<String> = self
      .cache
      .iter()
      .filter(|(_, e)| e.dirty)
      .map(|(id, _)| id.clone())
      .collect();
    for id in dirty {
      self.write_if_dirty(&id)?;
    }
    Ok(())
  }

  fn autopersist(&mut self, id: &str) -> Result<(), StorageError> {
    self.write_if_dirty(id)
  }

  fn set_avoid_atomic_write(&mut self, avoid: bool) {
    self.avoid_atomic_write = avoid;
  }

  fn is_persisted_fully(&self) -> bool {
    self.cache.values().all(|e| !e.dirty)
  }
}
