//! `stage('Build') { ... }`: a labelled block around its body.

use super::restore_as;
use crate::error::StepError;
use crate::step::{BodyOptions, Step, StepContext, StepExecution};
use crate::types::{FlowError, StepArguments, Value};
use serde::{Deserialize, Serialize};

pub struct StageStep;

impl Step for StageStep {
  fn name(&self) -> &str {
    "stage"
  }

  fn takes_body(&self) -> bool {
    true
  }

  fn label(&self, args: &StepArguments) -> Option<String> {
    args.get_str("name", 0).map(str::to_string)
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let name = args
      .get_str("name", 0)
      .ok_or_else(|| StepError::invalid("stage", "missing stage name"))?
      .to_string();
    let body = args
      .trailing_body()
      .cloned()
      .ok_or_else(|| StepError::invalid("stage", "missing body"))?;
    Ok(Box::new(Stage { name, body: Some(body) }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<Stage>("stage", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Stage {
  name: String,
  body: Option<Value>,
}

impl StepExecution for Stage {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    if let Some(body) = self.body.take() {
      ctx.invoke_body(body, BodyOptions::default());
    }
    Ok(false)
  }

  fn stop(&mut self, ctx: &StepContext, cause: FlowError) {
    ctx.cancel_bodies(cause);
  }

  fn status(&self) -> Option<String> {
    Some(format!("Stage {}", self.name))
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
