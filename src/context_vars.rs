//! Immutable, chained lookup environments for threads.
//!
//! Each [ContextVariableSet] is one scope of named values plus the names of
//! dynamic providers declared in it, with a shared pointer to its enclosing
//! scope. A lookup checks the scope's own values, then its providers, then walks
//! outward. Providers may look the same key up again; the lookup carries an
//! explicit recursion guard so a provider is never re-entered for the key it is
//! already computing.

use crate::types::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Key of the environment map every run can read.
pub const ENV: &str = "env";

/// One scope's own contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
  #[serde(default)]
  pub values: BTreeMap<String, Value>,
  /// Names of [DynamicContext] providers consulted for this scope.
  #[serde(default)]
  pub dynamic: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Scope>", into = "Vec<Scope>")]
pub struct ContextVariableSet {
  scope: Arc<Scope>,
  parent: Option<Arc<ContextVariableSet>>,
}

impl ContextVariableSet {
  /// Root scope holding `values` and consulting `dynamic` providers.
  pub fn root(values: BTreeMap<String, Value>, dynamic: Vec<String>) -> Self {
    Self {
      scope: Arc::new(Scope { values, dynamic }),
      parent: None,
    }
  }

  /// A child scope. The receiver is shared, not copied.
  pub fn with(&self, values: BTreeMap<String, Value>, dynamic: Vec<String>) -> Self {
    Self {
      scope: Arc::new(Scope { values, dynamic }),
      parent: Some(Arc::new(self.clone())),
    }
  }

  pub fn get(&self, key: &str, registry: &ContextRegistry) -> Option<Value> {
    ContextLookup::new(self.clone(), registry).get(key)
  }

  /// Scopes from outermost to innermost.
  pub fn to_scopes(&self) -> Vec<Scope> {
    let mut out = Vec::new();
    let mut node = Some(self);
    while let Some(set) = node {
      out.push((*set.scope).clone());
      node = set.parent.as_deref();
    }
    out.reverse();
    out
  }

  pub fn from_scopes(scopes: Vec<Scope>) -> Self {
    let mut set: Option<ContextVariableSet> = None;
    for scope in scopes {
      set = Some(ContextVariableSet {
        scope: Arc::new(scope),
        parent: set.map(Arc::new),
      });
    }
    set.unwrap_or_default()
  }

  pub fn depth(&self) -> usize {
    1 + self.parent.as_ref().map_or(0, |p| p.depth())
  }
}

impl PartialEq for ContextVariableSet {
  fn eq(&self, other: &Self) -> bool {
    self.to_scopes() == other.to_scopes()
  }
}

impl From<Vec<Scope>> for ContextVariableSet {
  fn from(scopes: Vec<Scope>) -> Self {
    Self::from_scopes(scopes)
  }
}

impl From<ContextVariableSet> for Vec<Scope> {
  fn from(set: ContextVariableSet) -> Self {
    set.to_scopes()
  }
}

/// A provider that computes a context value on demand.
pub trait DynamicContext: Send + Sync {
  fn name(&self) -> &str;
  /// Value for `key`, or `None` to defer to enclosing scopes.
  fn get(&self, key: &str, lookup: &mut ContextLookup<'_>) -> Option<Value>;
}

/// In-progress lookup handed to providers so they can consult enclosing context.
pub struct ContextLookup<'r> {
  at: ContextVariableSet,
  registry: &'r ContextRegistry,
  guard: Vec<(String, String)>,
}

impl<'r> ContextLookup<'r> {
  fn new(at: ContextVariableSet, registry: &'r ContextRegistry) -> Self {
    Self {
      at,
      registry,
      guard: Vec::new(),
    }
  }

  pub fn get(&mut self, key: &str) -> Option<Value> {
    let mut node = Some(self.at.clone());
    while let Some(set) = node {
      if let Some(v) = set.scope.values.get(key) {
        return Some(v.clone());
      }
      for name in &set.scope.dynamic {
        let mark = (name.clone(), key.to_string());
        if self.guard.contains(&mark) {
          continue;
        }
        let Some(provider) = self.registry.get(name) else {
          continue;
        };
        self.guard.push(mark);
        let saved = std::mem::replace(&mut self.at, set.clone());
        let found = provider.get(key, self);
        self.at = saved;
        self.guard.pop();
        if found.is_some() {
          return found;
        }
      }
      node = set.parent.as_deref().cloned();
    }
    None
  }
}

/// Registered providers by name.
#[derive(Default, Clone)]
pub struct ContextRegistry {
  providers: IndexMap<String, Arc<dyn DynamicContext>>,
}

impl fmt::Debug for ContextRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.providers.keys()).finish()
  }
}

impl ContextRegistry {
  pub fn register(&mut self, provider: Arc<dyn DynamicContext>) {
    self.providers.insert(provider.name().to_string(), provider);
  }

  pub fn get(&self, name: &str) -> Option<&Arc<dyn DynamicContext>> {
    self.providers.get(name)
  }
}

/// Provides `env`: the enclosing environment with engine defaults filled in underneath.
pub struct DefaultEnv {
  defaults: IndexMap<String, String>,
}

impl DefaultEnv {
  pub const NAME: &'static str = "default-env";

  pub fn new(defaults: IndexMap<String, String>) -> Self {
    Self { defaults }
  }
}

impl DynamicContext for DefaultEnv {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn get(&self, key: &str, lookup: &mut ContextLookup<'_>) -> Option<Value> {
    if key != ENV {
      return None;
    }
    let mut env: IndexMap<String, Value> = self
      .defaults
      .iter()
      .map(|(k, v)| (k.clone(), Value::str(v.clone())))
      .collect();
    if let Some(Value::Map(outer)) = lookup.get(key) {
      env.extend(outer);
    }
    Some(Value::Map(env))
  }
}
