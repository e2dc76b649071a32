//! `def l = acquire 'db'` / `release l`: leases on named resources.
//!
//! A [Lease] is a live value. It is pickled as kind [LEASE_KIND] and reattached
//! to the engine's [LeasePool] when a program is loaded; an offline pool makes
//! that resolution fail.

use super::restore_as;
use crate::error::{PersistError, StepError};
use crate::pickle::{PickleFactory, PickleResolver};
use crate::step::{Step, StepContext, StepExecution};
use crate::types::{LiveHandle, LiveResource, Pickle, StepArguments, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

pub const LEASE_KIND: &str = "lease";

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
  pub resource: String,
  pub id: u64,
}

impl LiveResource for Lease {
  fn kind(&self) -> &'static str {
    LEASE_KIND
  }

  fn describe(&self) -> String {
    format!("lease {}#{}", self.resource, self.id)
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

/// Tracks which leases are held.
#[derive(Debug, Default)]
pub struct LeasePool {
  held: Mutex<BTreeMap<u64, String>>,
  next_id: AtomicU64,
  offline: AtomicBool,
}

impl LeasePool {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn acquire(&self, resource: &str) -> Lease {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    self.held.lock().insert(id, resource.to_string());
    info!(resource, id, "lease acquired");
    Lease {
      resource: resource.to_string(),
      id,
    }
  }

  /// Returns false when `lease` was not held.
  pub fn release(&self, lease: &Lease) -> bool {
    let released = self.held.lock().remove(&lease.id).is_some();
    debug!(resource = %lease.resource, id = lease.id, released, "lease released");
    released
  }

  /// Takes `lease` over after a restart.
  pub fn reattach(&self, lease: &Lease) -> Result<(), PersistError> {
    if self.is_offline() {
      return Err(PersistError::Rehydrate {
        kind: LEASE_KIND.to_string(),
        message: format!("lease pool is offline; cannot reattach {}", lease.describe()),
      });
    }
    self.next_id.fetch_max(lease.id, Ordering::SeqCst);
    self.held.lock().insert(lease.id, lease.resource.clone());
    Ok(())
  }

  pub fn is_held(&self, resource: &str) -> bool {
    self.held.lock().values().any(|r| r == resource)
  }

  pub fn held_count(&self) -> usize {
    self.held.lock().len()
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn is_offline(&self) -> bool {
    self.offline.load(Ordering::SeqCst)
  }
}

/// Writes [Lease] values as pickles.
pub struct LeaseFactory;

impl PickleFactory for LeaseFactory {
  fn writes(&self, live: &LiveHandle) -> Option<Pickle> {
    let lease = live.downcast_ref::<Lease>()?;
    Some(Pickle {
      kind: LEASE_KIND.to_string(),
      data: serde_json::to_value(lease).ok()?,
    })
  }
}

/// Reattaches pickled leases to a pool.
pub struct LeaseResolver {
  pool: Arc<LeasePool>,
}

impl LeaseResolver {
  pub fn new(pool: Arc<LeasePool>) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl PickleResolver for LeaseResolver {
  fn kind(&self) -> &str {
    LEASE_KIND
  }

  async fn resolve(&self, pickle: &Pickle) -> Result<LiveHandle, PersistError> {
    let lease: Lease = serde_json::from_value(pickle.data.clone()).map_err(PersistError::Deserialize)?;
    self.pool.reattach(&lease)?;
    Ok(LiveHandle::new(lease))
  }
}

pub struct AcquireStep;

impl Step for AcquireStep {
  fn name(&self) -> &str {
    "acquire"
  }

  fn label(&self, args: &StepArguments) -> Option<String> {
    args.get_str("resource", 0).map(str::to_string)
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let resource = args
      .get_str("resource", 0)
      .ok_or_else(|| StepError::invalid("acquire", "missing resource name"))?
      .to_string();
    Ok(Box::new(Acquire { resource }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<Acquire>("acquire", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Acquire {
  resource: String,
}

impl StepExecution for Acquire {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    let lease = ctx.host().leases.acquire(&self.resource);
    ctx.on_success(Value::Live(LiveHandle::new(lease)));
    Ok(true)
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}

pub struct ReleaseStep;

impl Step for ReleaseStep {
  fn name(&self) -> &str {
    "release"
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let lease = args
      .get("lease", 0)
      .and_then(Value::as_live)
      .and_then(|h| h.downcast_ref::<Lease>())
      .cloned()
      .ok_or_else(|| StepError::invalid("release", "expected a lease"))?;
    Ok(Box::new(Release { lease }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<Release>("release", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Release {
  lease: Lease,
}

impl StepExecution for Release {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    let released = ctx.host().leases.release(&self.lease);
    ctx.on_success(Value::Bool(released));
    Ok(true)
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
