//! `waitForSignal 'name'`: suspends until the host fires the named signal.
//!
//! Signals are latched on the engine's [SignalBoard]: a signal fired before
//! anyone waits is delivered to every later waiter.

use super::restore_as;
use crate::error::StepError;
use crate::step::{Step, StepContext, StepExecution};
use crate::types::{FlowError, StepArguments, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Default)]
struct Board {
  fired: HashMap<String, Value>,
  waiters: HashMap<String, Vec<StepContext>>,
}

/// Named signals shared by every execution of an engine.
#[derive(Default)]
pub struct SignalBoard {
  board: Mutex<Board>,
}

impl std::fmt::Debug for SignalBoard {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let b = self.board.lock();
    f.debug_struct("SignalBoard")
      .field("fired", &b.fired.keys().collect::<Vec<_>>())
      .field("waiting", &b.waiters.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl SignalBoard {
  /// Waits on `name` with `ctx`. Returns true when the signal had already
  /// fired and `ctx` was completed on the spot.
  pub fn register(&self, name: &str, ctx: &StepContext) -> bool {
    let fired = {
      let mut b = self.board.lock();
      match b.fired.get(name) {
        Some(v) => Some(v.clone()),
        None => {
          b.waiters.entry(name.to_string()).or_default().push(ctx.clone());
          None
        }
      }
    };
    match fired {
      Some(v) => {
        ctx.on_success(v);
        true
      }
      None => false,
    }
  }

  /// Fires `name`, completing current waiters. Returns how many were waiting.
  pub fn fire(&self, name: &str, value: Value) -> usize {
    let waiters = {
      let mut b = self.board.lock();
      b.fired.insert(name.to_string(), value.clone());
      b.waiters.remove(name).unwrap_or_default()
    };
    debug!(signal = name, waiters = waiters.len(), "signal fired");
    for ctx in &waiters {
      ctx.on_success(value.clone());
    }
    waiters.len()
  }

  /// Stops `ctx` waiting on `name`.
  pub fn remove(&self, name: &str, ctx: &StepContext) {
    let mut b = self.board.lock();
    if let Some(list) = b.waiters.get_mut(name) {
      list.retain(|c| !(c.id() == ctx.id() && c.execution().id() == ctx.execution().id()));
    }
  }

  pub fn is_fired(&self, name: &str) -> bool {
    self.board.lock().fired.contains_key(name)
  }

  pub fn waiting(&self, name: &str) -> usize {
    self.board.lock().waiters.get(name).map_or(0, Vec::len)
  }
}

pub struct WaitForSignalStep;

impl Step for WaitForSignalStep {
  fn name(&self) -> &str {
    "waitForSignal"
  }

  fn label(&self, args: &StepArguments) -> Option<String> {
    args.get_str("name", 0).map(|n| format!("Waiting for {}", n))
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let name = args
      .get_str("name", 0)
      .ok_or_else(|| StepError::invalid("waitForSignal", "missing signal name"))?
      .to_string();
    Ok(Box::new(WaitForSignal { name }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<WaitForSignal>("waitForSignal", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct WaitForSignal {
  name: String,
}

impl StepExecution for WaitForSignal {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    Ok(ctx.host().signals.register(&self.name, ctx))
  }

  fn stop(&mut self, ctx: &StepContext, cause: FlowError) {
    ctx.host().signals.remove(&self.name, ctx);
    ctx.on_failure(cause);
  }

  fn on_resume(&mut self, ctx: &StepContext) {
    ctx.host().signals.register(&self.name, ctx);
  }

  fn status(&self) -> Option<String> {
    Some(format!("Waiting for signal '{}'", self.name))
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
