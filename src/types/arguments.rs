//! Arguments of a step call: positional values plus named values in call order.

use super::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepArguments {
  #[serde(default)]
  pub positional: Vec<Value>,
  #[serde(default)]
  pub named: IndexMap<String, Value>,
}

impl StepArguments {
  pub fn new(positional: Vec<Value>, named: IndexMap<String, Value>) -> Self {
    Self { positional, named }
  }

  /// Named value `key`, falling back to the positional value at `index`.
  pub fn get(&self, key: &str, index: usize) -> Option<&Value> {
    self.named.get(key).or_else(|| self.positional.get(index))
  }

  pub fn get_str(&self, key: &str, index: usize) -> Option<&str> {
    self.get(key, index).and_then(Value::as_str)
  }

  pub fn get_int(&self, key: &str, index: usize) -> Option<i64> {
    self.get(key, index).and_then(Value::as_int)
  }

  pub fn get_bool(&self, key: &str) -> Option<bool> {
    self.named.get(key).and_then(Value::as_bool)
  }

  /// The last positional argument when it is a body (trailing closure syntax).
  pub fn trailing_body(&self) -> Option<&Value> {
    self
      .positional
      .last()
      .filter(|v| matches!(v, Value::Body(_) | Value::Closure(_)))
  }

  /// Mutable access to every argument value, for closure export.
  pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
    self.positional.iter_mut().chain(self.named.values_mut())
  }

  /// Short rendering for the node's arguments action.
  pub fn summary(&self) -> String {
    let mut parts: Vec<String> = self
      .positional
      .iter()
      .filter(|v| !matches!(v, Value::Body(_) | Value::Closure(_)))
      .map(|v| v.to_string())
      .collect();
    for (k, v) in &self.named {
      if !matches!(v, Value::Body(_) | Value::Closure(_)) {
        parts.push(format!("{}: {}", k, v));
      }
    }
    parts.join(", ")
  }
}

#[cfg(test)]
mod tests {
  use super::StepArguments;
  use crate::types::Value;
  use indexmap::IndexMap;

  #[test]
  fn named_wins_over_positional() {
    let mut named = IndexMap::new();
    named.insert("message".to_string(), Value::str("named"));
    let args = StepArguments::new(vec![Value::str("positional")], named);
    assert_eq!(args.get_str("message", 0), Some("named"));
    assert_eq!(args.get_str("other", 0), Some("positional"));
  }

  #[test]
  fn summary_skips_bodies() {
    let mut named = IndexMap::new();
    named.insert("a".to_string(), Value::Body(3));
    named.insert("failFast".to_string(), Value::Bool(true));
    let args = StepArguments::new(vec![Value::str("x"), Value::Body(4)], named);
    assert_eq!(args.summary(), "x, failFast: true");
    assert_eq!(args.trailing_body(), Some(&Value::Body(4)));
  }
}
