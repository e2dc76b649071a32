//! `echo 'message'`: writes a line to the run's console.

use super::restore_as;
use crate::error::StepError;
use crate::step::{Step, StepContext, StepExecution};
use crate::types::{StepArguments, Value};
use serde::{Deserialize, Serialize};

pub struct EchoStep;

impl Step for EchoStep {
  fn name(&self) -> &str {
    "echo"
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let message = args
      .get("message", 0)
      .ok_or_else(|| StepError::invalid("echo", "missing message"))?
      .to_string();
    Ok(Box::new(Echo { message }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<Echo>("echo", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Echo {
  message: String,
}

impl StepExecution for Echo {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    ctx.console().println(&self.message);
    ctx.on_success(Value::Null);
    Ok(true)
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
