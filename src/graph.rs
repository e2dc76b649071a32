//! Walking the flow graph backwards from its heads.

use crate::error::StorageError;
use crate::storage::FlowNodeStorage;
use crate::types::FlowNode;
use std::collections::HashSet;
use tracing::{instrument, warn};

/// Nodes reached by a scan, plus every node that could not be loaded.
#[derive(Debug, Default)]
pub struct GraphScan {
  /// Visit order: depth first from the first head, parents in declared order.
  pub nodes: Vec<FlowNode>,
  pub errors: Vec<StorageError>,
}

impl GraphScan {
  /// Nodes ordered by numeric id (creation order).
  pub fn sorted(&self) -> Vec<FlowNode> {
    let mut nodes = self.nodes.clone();
    nodes.sort_by_key(|n| id_number(&n.id));
    nodes
  }

  pub fn is_complete(&self) -> bool {
    self.errors.is_empty()
  }
}

/// Depth-first walk over parents. Missing or corrupt nodes are recorded as
/// errors and their ancestry is skipped; the scan itself never fails.
pub struct DepthFirstScanner<'s> {
  storage: &'s mut dyn FlowNodeStorage,
}

impl<'s> DepthFirstScanner<'s> {
  pub fn new(storage: &'s mut dyn FlowNodeStorage) -> Self {
    Self { storage }
  }

  #[instrument(level = "trace", skip(self))]
  pub fn scan(&mut self, heads: &[String]) -> GraphScan {
    let mut out = GraphScan::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = heads.iter().rev().cloned().collect();
    while let Some(id) = stack.pop() {
      if !seen.insert(id.clone()) {
        continue;
      }
      match self.storage.get_node(&id) {
        Ok(node) => {
          for parent in node.parents.iter().rev() {
            if !seen.contains(parent) {
              stack.push(parent.clone());
            }
          }
          out.nodes.push(node);
        }
        Err(e) => {
          warn!(node_id = %id, error = %e, "flow node could not be loaded");
          out.errors.push(e);
        }
      }
    }
    out
  }
}

/// Numeric value of a node id; non-numeric ids sort last.
pub fn id_number(id: &str) -> u64 {
  id.parse().unwrap_or(u64::MAX)
}
