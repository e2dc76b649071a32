//! Tests for `Value`.

use super::{Closure, CodeRef, LiveHandle, LiveResource, Pickle, Value};
use indexmap::IndexMap;
use std::any::Any;
use std::collections::BTreeMap;

#[derive(Debug)]
struct Token(&'static str);

impl LiveResource for Token {
  fn kind(&self) -> &'static str {
    "token"
  }
  fn describe(&self) -> String {
    format!("token {}", self.0)
  }
  fn as_any(&self) -> &dyn Any {
    self
  }
}

#[test]
fn display_lists_and_maps_groovy_style() {
  let mut m = IndexMap::new();
  m.insert("a".to_string(), Value::Int(1));
  m.insert("b".to_string(), Value::List(vec![Value::str("x"), Value::Bool(true)]));
  assert_eq!(Value::Map(m).to_string(), "[a:1, b:[x, true]]");
  assert_eq!(Value::Map(IndexMap::new()).to_string(), "[:]");
  assert_eq!(Value::Null.to_string(), "null");
}

#[test]
fn live_handles_compare_by_identity() {
  let a = LiveHandle::new(Token("a"));
  let b = LiveHandle::new(Token("a"));
  assert_eq!(a, a.clone());
  assert_ne!(a, b);
  assert_eq!(a.downcast_ref::<Token>().map(|t| t.0), Some("a"));
}

#[test]
fn live_values_refuse_to_serialize() {
  let v = Value::List(vec![Value::Live(LiveHandle::new(Token("t")))]);
  assert!(serde_json::to_string(&v).is_err());
}

#[test]
fn visit_mut_reaches_closure_captures() {
  let mut captured = BTreeMap::new();
  captured.insert("lease".to_string(), Value::Live(LiveHandle::new(Token("t"))));
  let mut v = Value::List(vec![
    Value::Int(1),
    Value::Closure(Closure {
      code: CodeRef::new("WorkflowScript", 1),
      captured,
    }),
  ]);
  let mut live = 0;
  v.visit_mut::<(), _>(&mut |leaf| {
    let kind = match leaf {
      Value::Live(h) => h.kind(),
      _ => return Ok(()),
    };
    live += 1;
    *leaf = Value::Pickled(Pickle {
      kind: kind.to_string(),
      data: serde_json::Value::Null,
    });
    Ok(())
  })
  .unwrap();
  assert_eq!(live, 1);
  let json = serde_json::to_string(&v).unwrap();
  let back: Value = serde_json::from_str(&json).unwrap();
  assert_eq!(back, v);
}
