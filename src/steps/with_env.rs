//! `withEnv(['NAME=value', ...]) { ... }`: runs the body with extra environment entries.

use super::restore_as;
use crate::context_vars::ENV;
use crate::error::StepError;
use crate::step::{BodyOptions, Step, StepContext, StepExecution};
use crate::types::{FlowError, StepArguments, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub struct WithEnvStep;

/// Splits `NAME=value` entries. An entry without `=` sets an empty value.
pub fn parse_overrides(entries: &[Value]) -> Result<IndexMap<String, String>, StepError> {
  let mut out = IndexMap::new();
  for e in entries {
    let s = e
      .as_str()
      .ok_or_else(|| StepError::invalid("withEnv", format!("expected NAME=value, got {}", e.type_name())))?;
    let (k, v) = s.split_once('=').unwrap_or((s, ""));
    if k.is_empty() {
      return Err(StepError::invalid("withEnv", format!("empty variable name in '{}'", s)));
    }
    out.insert(k.to_string(), v.to_string());
  }
  Ok(out)
}

impl Step for WithEnvStep {
  fn name(&self) -> &str {
    "withEnv"
  }

  fn takes_body(&self) -> bool {
    true
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let overrides = match args.get("overrides", 0) {
      Some(Value::List(items)) => parse_overrides(items)?,
      Some(other) => {
        return Err(StepError::invalid(
          "withEnv",
          format!("expected a list, got {}", other.type_name()),
        ));
      }
      None => return Err(StepError::invalid("withEnv", "missing overrides")),
    };
    let body = args
      .trailing_body()
      .cloned()
      .ok_or_else(|| StepError::invalid("withEnv", "missing body"))?;
    Ok(Box::new(WithEnv {
      overrides,
      body: Some(body),
    }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<WithEnv>("withEnv", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct WithEnv {
  overrides: IndexMap<String, String>,
  body: Option<Value>,
}

impl StepExecution for WithEnv {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    let Some(body) = self.body.take() else {
      return Ok(false);
    };
    let mut env = match ctx.get(ENV) {
      Some(Value::Map(m)) => m,
      _ => IndexMap::new(),
    };
    for (k, v) in &self.overrides {
      env.insert(k.clone(), Value::str(v.clone()));
    }
    ctx.invoke_body(body, BodyOptions::default().with_context(ENV, Value::Map(env)));
    Ok(false)
  }

  fn stop(&mut self, ctx: &StepContext, cause: FlowError) {
    ctx.cancel_bodies(cause);
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
