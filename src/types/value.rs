//! Script values: everything a continuation can hold on its operand stack or in a local.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Location of a compiled block: script name plus block index within that script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeRef {
  pub script: String,
  pub block: u32,
}

impl CodeRef {
  pub fn new(script: impl Into<String>, block: u32) -> Self {
    Self {
      script: script.into(),
      block,
    }
  }
}

/// A closure: code plus a snapshot of the variables visible where it was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
  pub code: CodeRef,
  #[serde(default)]
  pub captured: BTreeMap<String, Value>,
}

/// Serializable stand-in for a live resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pickle {
  pub kind: String,
  pub data: serde_json::Value,
}

impl fmt::Display for Pickle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind, self.data)
  }
}

/// A resource that only exists in this process (a lease, a connection, an agent).
pub trait LiveResource: fmt::Debug + Send + Sync + 'static {
  /// Pickle kind this resource is written as.
  fn kind(&self) -> &'static str;
  /// Human readable description for logs and `echo`.
  fn describe(&self) -> String;
  fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a [LiveResource]. Equality is identity.
#[derive(Debug, Clone)]
pub struct LiveHandle(Arc<dyn LiveResource>);

impl LiveHandle {
  pub fn new(resource: impl LiveResource) -> Self {
    Self(Arc::new(resource))
  }

  pub fn kind(&self) -> &'static str {
    self.0.kind()
  }

  pub fn describe(&self) -> String {
    self.0.describe()
  }

  pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
    self.0.as_any().downcast_ref::<T>()
  }
}

impl PartialEq for LiveHandle {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

/// A value in the pipeline language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
  #[default]
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
  List(Vec<Value>),
  Map(IndexMap<String, Value>),
  Closure(Closure),
  /// A closure exported to a step context, by id in the thread group's closure table.
  Body(u32),
  /// A live resource written out by a pickle factory.
  Pickled(Pickle),
  /// Process-local resource. Must be pickled before the value can be serialized.
  #[serde(skip)]
  Live(LiveHandle),
}

impl Value {
  pub fn str(s: impl Into<String>) -> Value {
    Value::Str(s.into())
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
    match self {
      Value::Map(m) => Some(m),
      _ => None,
    }
  }

  pub fn as_live(&self) -> Option<&LiveHandle> {
    match self {
      Value::Live(h) => Some(h),
      _ => None,
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// Type name used in error messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Bool(_) => "Boolean",
      Value::Int(_) => "Integer",
      Value::Str(_) => "String",
      Value::List(_) => "List",
      Value::Map(_) => "Map",
      Value::Closure(_) | Value::Body(_) => "Closure",
      Value::Pickled(_) | Value::Live(_) => "Resource",
    }
  }

  /// Visits every leaf value (anything that is not a list, map, or closure) mutably,
  /// descending into closure captures.
  pub fn visit_mut<E, F>(&mut self, f: &mut F) -> Result<(), E>
  where
    F: FnMut(&mut Value) -> Result<(), E>,
  {
    match self {
      Value::List(items) => {
        for v in items {
          v.visit_mut(f)?;
        }
      }
      Value::Map(entries) => {
        for v in entries.values_mut() {
          v.visit_mut(f)?;
        }
      }
      Value::Closure(c) => {
        for v in c.captured.values_mut() {
          v.visit_mut(f)?;
        }
      }
      _ => f(self)?,
    }
    Ok(())
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => write!(f, "null"),
      Value::Bool(b) => write!(f, "{}", b),
      Value::Int(i) => write!(f, "{}", i),
      Value::Str(s) => write!(f, "{}", s),
      Value::List(items) => {
        write!(f, "[")?;
        for (i, v) in items.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{}", v)?;
        }
        write!(f, "]")
      }
      Value::Map(entries) => {
        if entries.is_empty() {
          return write!(f, "[:]");
        }
        write!(f, "[")?;
        for (i, (k, v)) in entries.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{}:{}", k, v)?;
        }
        write!(f, "]")
      }
      Value::Closure(c) => write!(f, "<closure {}#{}>", c.code.script, c.code.block),
      Value::Body(id) => write!(f, "<body #{}>", id),
      Value::Pickled(p) => write!(f, "<pickle {}>", p.kind),
      Value::Live(h) => write!(f, "{}", h.describe()),
    }
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::Str(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::Str(s)
  }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self {
    Value::Int(i)
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}
