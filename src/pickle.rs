//! Pickling of live resources.
//!
//! Before program state is written, every [Value::Live] is replaced by a
//! [Pickle] produced by the first [PickleFactory] that recognizes it. On load,
//! each pickle is handed to the [PickleResolver] registered for its kind; all of
//! them must resolve before the thread group is rebuilt.

use crate::error::PersistError;
use crate::types::{LiveHandle, Pickle, Value};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Writes live resources as pickles.
pub trait PickleFactory: Send + Sync {
  /// A pickle for `live`, or `None` when this factory does not handle it.
  fn writes(&self, live: &LiveHandle) -> Option<Pickle>;
}

/// Turns pickles of one kind back into live resources.
#[async_trait]
pub trait PickleResolver: Send + Sync {
  fn kind(&self) -> &str;
  async fn resolve(&self, pickle: &Pickle) -> Result<LiveHandle, PersistError>;
}

#[derive(Default, Clone)]
pub struct PickleRegistry {
  factories: Vec<Arc<dyn PickleFactory>>,
  resolvers: HashMap<String, Arc<dyn PickleResolver>>,
}

impl fmt::Debug for PickleRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PickleRegistry")
      .field("factories", &self.factories.len())
      .field("resolvers", &self.resolvers.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl PickleRegistry {
  pub fn add_factory(&mut self, factory: Arc<dyn PickleFactory>) {
    self.factories.push(factory);
  }

  pub fn add_resolver(&mut self, resolver: Arc<dyn PickleResolver>) {
    self.resolvers.insert(resolver.kind().to_string(), resolver);
  }

  /// Drops every factory. Saves are skipped until one is added again.
  pub fn clear_factories(&mut self) {
    self.factories.clear();
  }

  pub fn has_factories(&self) -> bool {
    !self.factories.is_empty()
  }

  /// Replaces every live value inside `value` with its pickle.
  pub fn pickle(&self, value: &mut Value) -> Result<(), PersistError> {
    value.visit_mut(&mut |leaf: &mut Value| {
      let Value::Live(handle) = leaf else {
        return Ok(());
      };
      let pickle = self
        .factories
        .iter()
        .find_map(|f| f.writes(handle))
        .ok_or_else(|| PersistError::NoFactory(handle.kind().to_string()))?;
      debug!(kind = %pickle.kind, "pickled live value");
      *leaf = Value::Pickled(pickle);
      Ok(())
    })
  }

  pub fn resolver(&self, kind: &str) -> Result<Arc<dyn PickleResolver>, PersistError> {
    self
      .resolvers
      .get(kind)
      .cloned()
      .ok_or_else(|| PersistError::NoResolver(kind.to_string()))
  }
}

/// Pickles reachable from `values`, in traversal order.
pub fn collect_pickles<'a>(values: impl Iterator<Item = &'a mut Value>) -> Vec<Pickle> {
  let mut out = Vec::new();
  for v in values {
    let _ = v.visit_mut(&mut |leaf: &mut Value| -> Result<(), ()> {
      if let Value::Pickled(p) = leaf {
        out.push(p.clone());
      }
      Ok(())
    });
  }
  out
}

/// Replaces pickles reachable from `values` with `resolved`, in the same
/// traversal order [collect_pickles] used.
pub fn replace_pickles<'a>(
  values: impl Iterator<Item = &'a mut Value>,
  resolved: Vec<LiveHandle>,
) -> Result<(), PersistError> {
  let mut resolved = resolved.into_iter();
  for v in values {
    v.visit_mut(&mut |leaf: &mut Value| {
      if let Value::Pickled(p) = leaf {
        let live = resolved.next().ok_or_else(|| PersistError::Rehydrate {
          kind: p.kind.clone(),
          message: "fewer resolved values than pickles".to_string(),
        })?;
        *leaf = Value::Live(live);
      }
      Ok::<(), PersistError>(())
    })?;
  }
  Ok(())
}

/// Resolves `pickle`, retrying up to `retries` extra times with exponential
/// backoff plus jitter.
#[instrument(level = "trace", skip(resolver, pickle), fields(kind = %pickle.kind))]
pub async fn resolve_with_retry(
  resolver: Arc<dyn PickleResolver>,
  pickle: Pickle,
  retries: u32,
  backoff: Duration,
) -> Result<LiveHandle, PersistError> {
  let mut attempt = 0;
  loop {
    match resolver.resolve(&pickle).await {
      Ok(live) => return Ok(live),
      Err(e) if attempt < retries => {
        let base = backoff.saturating_mul(1 << attempt.min(16));
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2);
        let delay = base + Duration::from_millis(jitter_ms);
        warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "pickle not resolved yet, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}
