//! `envVar 'NAME'`: the value of an environment entry, or null.

use super::restore_as;
use crate::context_vars::ENV;
use crate::error::StepError;
use crate::step::{Step, StepContext, StepExecution};
use crate::types::{StepArguments, Value};
use serde::{Deserialize, Serialize};

pub struct EnvVarStep;

impl Step for EnvVarStep {
  fn name(&self) -> &str {
    "envVar"
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let name = args
      .get_str("name", 0)
      .ok_or_else(|| StepError::invalid("envVar", "missing variable name"))?
      .to_string();
    Ok(Box::new(EnvVar { name }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<EnvVar>("envVar", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvVar {
  name: String,
}

impl StepExecution for EnvVar {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    let value = match ctx.get(ENV) {
      Some(Value::Map(mut env)) => env.shift_remove(&self.name).unwrap_or_default(),
      _ => Value::Null,
    };
    ctx.on_success(value);
    Ok(true)
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
