//! Flow heads: the tips of the graph, one per running branch.
//!
//! All head bookkeeping lives in a [HeadTable] guarded by a single lock on the
//! execution. Callers outside the table only ever get snapshots.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const INTERNED_IDS: u32 = 500;

static SMALL_IDS: Lazy<Vec<String>> = Lazy::new(|| (0..INTERNED_IDS).map(|i| i.to_string()).collect());

/// String id for node number `n`; small ids come from a prebuilt table.
pub fn node_id(n: u32) -> String {
  match SMALL_IDS.get(n as usize) {
    Some(s) => s.clone(),
    None => n.to_string(),
  }
}

/// A snapshot of one head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowHead {
  pub id: u32,
  pub node_id: String,
}

/// Current heads in fork (id) order, plus the stack of open program start nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadTable {
  #[serde(default)]
  heads: BTreeMap<u32, String>,
  #[serde(default)]
  start_nodes: Vec<String>,
}

impl HeadTable {
  pub fn get(&self, id: u32) -> Option<FlowHead> {
    self.heads.get(&id).map(|n| FlowHead {
      id,
      node_id: n.clone(),
    })
  }

  /// Adds a head at `node_id`. Replaces any head with the same id.
  pub fn insert(&mut self, id: u32, node_id: impl Into<String>) {
    self.heads.insert(id, node_id.into());
  }

  /// Points head `id` at a new tip. Returns the previous tip.
  pub fn set(&mut self, id: u32, node_id: impl Into<String>) -> Option<String> {
    self.heads.insert(id, node_id.into())
  }

  /// New head `new_id` at the same tip as `from`.
  pub fn fork(&mut self, from: u32, new_id: u32) -> Option<FlowHead> {
    let node_id = self.heads.get(&from)?.clone();
    self.heads.insert(new_id, node_id.clone());
    Some(FlowHead { id: new_id, node_id })
  }

  pub fn remove(&mut self, id: u32) -> Option<String> {
    self.heads.remove(&id)
  }

  pub fn first(&self) -> Option<FlowHead> {
    self.heads.iter().next().map(|(id, n)| FlowHead {
      id: *id,
      node_id: n.clone(),
    })
  }

  pub fn snapshot(&self) -> Vec<FlowHead> {
    self
      .heads
      .iter()
      .map(|(id, n)| FlowHead {
        id: *id,
        node_id: n.clone(),
      })
      .collect()
  }

  pub fn node_ids(&self) -> Vec<String> {
    self.heads.values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.heads.len()
  }

  pub fn is_empty(&self) -> bool {
    self.heads.is_empty()
  }

  pub fn is_current_head(&self, node_id: &str) -> bool {
    self.heads.values().any(|n| n == node_id)
  }

  /// Drops every head except `keep`, which is pointed at `node_id`.
  pub fn collapse(&mut self, keep: u32, node_id: impl Into<String>) {
    self.heads.clear();
    self.heads.insert(keep, node_id.into());
  }

  pub fn push_start(&mut self, node_id: impl Into<String>) {
    self.start_nodes.push(node_id.into());
  }

  pub fn pop_start(&mut self) -> Option<String> {
    self.start_nodes.pop()
  }

  pub fn start_nodes(&self) -> &[String] {
    &self.start_nodes
  }
}
