//! `load 'path/to/script'`: compiles another script and runs it in place.
//!
//! Paths resolve against the engine's workspace. The loaded source is kept with
//! the run so a restored program can recompile it.

use super::restore_as;
use crate::error::StepError;
use crate::step::{BodyOptions, Step, StepContext, StepExecution};
use crate::types::{FlowError, StepArguments, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub struct LoadStep;

impl Step for LoadStep {
  fn name(&self) -> &str {
    "load"
  }

  fn takes_body(&self) -> bool {
    true
  }

  fn label(&self, args: &StepArguments) -> Option<String> {
    args.get_str("path", 0).map(|p| format!("Loading {}", p))
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let path = args
      .get_str("path", 0)
      .ok_or_else(|| StepError::invalid("load", "missing path"))?
      .to_string();
    Ok(Box::new(Load { path, started: false }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<Load>("load", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Load {
  path: String,
  started: bool,
}

impl StepExecution for Load {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    let full = ctx.host().config.workspace.join(&self.path);
    let source = std::fs::read_to_string(&full)
      .map_err(|e| StepError::Failed(format!("cannot read {}: {}", full.display(), e)))?;
    let closure = ctx.load_script(&source)?;
    debug!(path = %self.path, script = %closure.code.script, "running loaded script");
    self.started = true;
    ctx.invoke_body(Value::Closure(closure), BodyOptions::default());
    Ok(false)
  }

  fn stop(&mut self, ctx: &StepContext, cause: FlowError) {
    if self.started {
      ctx.cancel_bodies(cause);
    } else {
      ctx.on_failure(cause);
    }
  }

  fn status(&self) -> Option<String> {
    Some(format!("Loading {}", self.path))
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
