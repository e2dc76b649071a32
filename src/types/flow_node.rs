//! Nodes of the append-only execution graph.

use super::{BuildResult, FlowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
  /// Opens the program.
  FlowStart,
  /// Closes the program; every remaining head is a parent.
  FlowEnd {
    start_id: String,
    result: BuildResult,
  },
  /// Opens a block step (or one branch of it).
  BlockStart { function: String },
  /// Closes the block opened by `start_id`.
  BlockEnd { start_id: String, function: String },
  /// A step without a body.
  Atom { function: String },
}

/// Metadata attached to a node. Actions are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
  Error { error: FlowError },
  Timing { started_at: DateTime<Utc> },
  Label { label: String },
  Arguments { summary: String },
  Placeholder { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
  pub id: String,
  pub kind: NodeKind,
  #[serde(default)]
  pub parents: Vec<String>,
  #[serde(default)]
  pub actions: Vec<Action>,
}

impl FlowNode {
  pub fn new(id: impl Into<String>, kind: NodeKind, parents: Vec<String>) -> Self {
    Self {
      id: id.into(),
      kind,
      parents,
      actions: Vec::new(),
    }
  }

  /// Builder-style action append.
  pub fn with_action(mut self, action: Action) -> Self {
    self.actions.push(action);
    self
  }

  /// Function (step) name for step nodes.
  pub fn function(&self) -> Option<&str> {
    match &self.kind {
      NodeKind::BlockStart { function }
      | NodeKind::BlockEnd { function, .. }
      | NodeKind::Atom { function } => Some(function),
      _ => None,
    }
  }

  pub fn label(&self) -> Option<&str> {
    self.actions.iter().find_map(|a| match a {
      Action::Label { label } => Some(label.as_str()),
      _ => None,
    })
  }

  pub fn error(&self) -> Option<&FlowError> {
    self.actions.iter().find_map(|a| match a {
      Action::Error { error } => Some(error),
      _ => None,
    })
  }

  pub fn has_error(&self) -> bool {
    self.error().is_some()
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self.kind, NodeKind::FlowEnd { .. })
  }

  pub fn is_block_start(&self) -> bool {
    matches!(self.kind, NodeKind::BlockStart { .. } | NodeKind::FlowStart)
  }

  pub fn display_name(&self) -> String {
    if let Some(label) = self.label() {
      return label.to_string();
    }
    match &self.kind {
      NodeKind::FlowStart => "Start of Pipeline".to_string(),
      NodeKind::FlowEnd { .. } => "End of Pipeline".to_string(),
      NodeKind::BlockStart { function } | NodeKind::Atom { function } => function.clone(),
      NodeKind::BlockEnd { function, .. } => format!("{} end", function),
    }
  }
}
