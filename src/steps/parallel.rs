//! `parallel a: { ... }, b: { ... }, failFast: true`: runs each branch on its own head.
//!
//! Completes once every branch has finished. Succeeds with a map of branch
//! results, or fails with the first branch failure to arrive. With `failFast`
//! the first failure interrupts the remaining branches.

use super::restore_as;
use crate::error::StepError;
use crate::step::{BodyOptions, Step, StepContext, StepExecution};
use crate::types::{BuildResult, FlowError, Outcome, StepArguments, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const BRANCH_PREFIX: &str = "Branch: ";

pub struct ParallelStep;

impl Step for ParallelStep {
  fn name(&self) -> &str {
    "parallel"
  }

  fn takes_body(&self) -> bool {
    true
  }

  fn create(&self, args: StepArguments) -> Result<Box<dyn StepExecution>, StepError> {
    let fail_fast = args.get_bool("failFast").unwrap_or(false);
    let branches: IndexMap<String, Value> = args
      .named
      .into_iter()
      .filter(|(k, v)| k != "failFast" && matches!(v, Value::Body(_) | Value::Closure(_)))
      .collect();
    if branches.is_empty() {
      return Err(StepError::invalid("parallel", "no branches given"));
    }
    Ok(Box::new(Parallel {
      pending: branches,
      fail_fast,
      results: IndexMap::new(),
      first_failure: None,
      cancelled: false,
    }))
  }

  fn restore(&self, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError> {
    restore_as::<Parallel>("parallel", state)
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Parallel {
  /// Branch bodies not launched yet; drained by `start`.
  pending: IndexMap<String, Value>,
  fail_fast: bool,
  /// Every branch by name, `None` while it runs.
  results: IndexMap<String, Option<Value>>,
  first_failure: Option<FlowError>,
  cancelled: bool,
}

impl Parallel {
  fn running(&self) -> usize {
    self.results.values().filter(|r| r.is_none()).count()
  }
}

impl StepExecution for Parallel {
  fn start(&mut self, ctx: &StepContext) -> Result<bool, StepError> {
    for (name, body) in std::mem::take(&mut self.pending) {
      self.results.insert(name.clone(), None);
      ctx.invoke_body(body, BodyOptions::labelled(format!("{}{}", BRANCH_PREFIX, name)));
    }
    Ok(false)
  }

  fn stop(&mut self, ctx: &StepContext, cause: FlowError) {
    self.cancelled = true;
    ctx.cancel_bodies(cause);
  }

  fn on_body_completed(&mut self, ctx: &StepContext, label: Option<&str>, outcome: Outcome) {
    let name = label
      .and_then(|l| l.strip_prefix(BRANCH_PREFIX))
      .unwrap_or_default()
      .to_string();
    debug!(branch = %name, failed = outcome.is_failure(), "branch finished");
    match outcome {
      Outcome::Normal(v) => {
        self.results.insert(name, Some(v));
      }
      Outcome::Abnormal(e) => {
        self.results.insert(name.clone(), Some(Value::Null));
        if self.first_failure.is_none() {
          self.first_failure = Some(e);
          if self.fail_fast && !self.cancelled {
            self.cancelled = true;
            ctx.cancel_bodies(FlowError::interrupted(
              BuildResult::Failure,
              format!("Failed in branch {}", name),
            ));
          }
        }
      }
    }
    if self.running() > 0 {
      return;
    }
    match self.first_failure.take() {
      Some(e) => {
        ctx.on_failure(e);
      }
      None => {
        let map = std::mem::take(&mut self.results)
          .into_iter()
          .map(|(k, v)| (k, v.unwrap_or_default()))
          .collect();
        ctx.on_success(Value::Map(map));
      }
    }
  }

  fn status(&self) -> Option<String> {
    Some(format!("{} of {} branches running", self.running(), self.results.len()))
  }

  fn save(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}
