use crate::context_vars::{
  ContextLookup, ContextRegistry, ContextVariableSet, DefaultEnv, DynamicContext, ENV,
};
use crate::types::Value;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Arc;

fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
  pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn registry() -> ContextRegistry {
  let mut defaults = IndexMap::new();
  defaults.insert("HOME".to_string(), "/home/ci".to_string());
  defaults.insert("MODE".to_string(), "default".to_string());
  let mut r = ContextRegistry::default();
  r.register(Arc::new(DefaultEnv::new(defaults)));
  r
}

#[test]
fn inner_scope_shadows_outer() {
  let r = ContextRegistry::default();
  let root = ContextVariableSet::root(vars(&[("a", Value::Int(1)), ("b", Value::Int(2))]), vec![]);
  let child = root.with(vars(&[("a", Value::Int(10))]), vec![]);
  assert_eq!(child.get("a", &r), Some(Value::Int(10)));
  assert_eq!(child.get("b", &r), Some(Value::Int(2)));
  assert_eq!(root.get("a", &r), Some(Value::Int(1)));
  assert_eq!(child.get("missing", &r), None);
  assert_eq!(child.depth(), 2);
}

#[test]
fn default_env_sits_under_overrides() {
  let r = registry();
  let root = ContextVariableSet::root(BTreeMap::new(), vec![DefaultEnv::NAME.to_string()]);
  let env = root.get(ENV, &r).unwrap();
  assert_eq!(env.as_map().unwrap().get("MODE"), Some(&Value::str("default")));

  let mut over = IndexMap::new();
  over.insert("MODE".to_string(), Value::str("custom"));
  let child = root.with(vars(&[(ENV, Value::Map(over))]), vec![]);
  let env = child.get(ENV, &r).unwrap();
  assert_eq!(env.as_map().unwrap().get("MODE"), Some(&Value::str("custom")));
}

struct Doubler;

impl DynamicContext for Doubler {
  fn name(&self) -> &str {
    "doubler"
  }

  fn get(&self, key: &str, lookup: &mut ContextLookup<'_>) -> Option<Value> {
    // Asks for the same key again; the guard must route this to the parent.
    let base = lookup.get(key)?.as_int()?;
    Some(Value::Int(base * 2))
  }
}

#[test]
fn provider_recursion_is_guarded() {
  let mut r = ContextRegistry::default();
  r.register(Arc::new(Doubler));
  let root = ContextVariableSet::root(vars(&[("n", Value::Int(3))]), vec![]);
  let child = root.with(BTreeMap::new(), vec!["doubler".to_string()]);
  let grandchild = child.with(BTreeMap::new(), vec!["doubler".to_string()]);
  assert_eq!(child.get("n", &r), Some(Value::Int(6)));
  // The same provider is not re-entered for the same key further out either.
  assert_eq!(grandchild.get("n", &r), Some(Value::Int(6)));
  assert_eq!(child.get("absent", &r), None);
}

#[test]
fn serde_round_trip_keeps_visibility() {
  let r = registry();
  let root = ContextVariableSet::root(vars(&[("x", Value::str("outer"))]), vec![DefaultEnv::NAME.to_string()]);
  let child = root.with(vars(&[("y", Value::Bool(true))]), vec![]);
  let json = serde_json::to_string(&child).unwrap();
  let back: ContextVariableSet = serde_json::from_str(&json).unwrap();
  assert_eq!(back, child);
  for key in ["x", "y", ENV, "nothing"] {
    assert_eq!(back.get(key, &r), child.get(key, &r), "key {}", key);
  }
}
