//! `sleep 5` / `sleep time: 500, unit: 'MILLISECONDS'`: waits without holding the lane.
//!
//! The deadline is absolute, so a restored sleep only waits for what is left.

use super::restore_as;
use crate::error::StepError;
use crate::step::{Step, StepContext, StepExecution};
use crate::types::{FlowError, StepArguments, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

pub struct SleepStep;

/// Parses the `time`/`unit` arguments into a duration.
pub fn sleep_duration(args: &StepArguments) -> Result<Duration, StepError> {
  let time = args
    .get_int("time", 0)
    .ok_or_else(|| StepError::invalid("sleep", "missing time"))?;
  let time = u64::try_from(time).map_err(|_| StepError::invalid("sleep", "time must not be negative"))?;
  let unit = args.get_str("unit", 1).unwrap_or("SECONDS");
  match unit {
    "MILLISECONDS" => Ok(Duration::from_millis(time)),
    "SECONDS" => Ok(Duration::from_secs(time)),
    "MINUTES" => Ok(Duration::from_secs(time.saturating_mul(60))),
    "HOURS" => Ok(Duration::from_secs(time.saturating_mul(3600))),
    other => Err(StepError::invalid("sleep", format!("unknown unit '{}'", other))),
  }
}

impl Step for SleepStep {
  fn name(&self) -> &str {
    "sleep"
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let duration = sleep_duration(&args)?;
    Ok(Box::new(Sleep {
      duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
      deadline: None,
      timer: None,
    }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<Sleep>("sleep", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Sleep {
  duration_ms: u64,
  deadline: Option<DateTime<Utc>>,
  #[serde(skip)]
  timer: Option<AbortHandle>,
}

impl Sleep {
  fn remaining(&self) -> Duration {
    self
      .deadline
      .map(|d| (d - Utc::now()).to_std().unwrap_or(Duration::ZERO))
      .unwrap_or(Duration::ZERO)
  }

  fn schedule(&mut self, ctx: &StepContext) {
    let remaining = self.remaining();
    let ctx = ctx.clone();
    debug!(remaining_ms = remaining.as_millis() as u64, "sleep scheduled");
    let handle = tokio::spawn(async move {
      tokio::time::sleep(remaining).await;
      ctx.on_success(Value::Null);
    });
    self.timer = Some(handle.abort_handle());
  }
}

impl StepExecution for Sleep {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    if self.duration_ms == 0 {
      ctx.on_success(Value::Null);
      return Ok(true);
    }
    let duration = chrono::Duration::milliseconds(i64::try_from(self.duration_ms).unwrap_or(i64::MAX));
    self.deadline = Some(Utc::now() + duration);
    self.schedule(ctx);
    Ok(false)
  }

  fn stop(&mut self, ctx: &StepContext, cause: FlowError) {
    if let Some(timer) = self.timer.take() {
      timer.abort();
    }
    ctx.on_failure(cause);
  }

  fn on_resume(&mut self, ctx: &StepContext) {
    self.schedule(ctx);
  }

  fn status(&self) -> Option<String> {
    Some(format!("Sleeping for {} sec", self.remaining().as_secs()))
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
