//! `error 'message'`: fails with the given message.

use super::restore_as;
use crate::error::StepError;
use crate::step::{Step, StepContext, StepExecution};
use crate::types::{FlowError, StepArguments};
use serde::{Deserialize, Serialize};

pub struct ErrorStep;

impl Step for ErrorStep {
  fn name(&self) -> &str {
    "error"
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let message = args
      .get("message", 0)
      .map(|v| v.to_string())
      .unwrap_or_else(|| "error".to_string());
    Ok(Box::new(Raise { message }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<Raise>("error", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Raise {
  message: String,
}

impl StepExecution for Raise {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    ctx.on_failure(FlowError::error(self.message.clone()));
    Ok(true)
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
