//! Overall result of a flow execution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result of a run, ordered from best to worst.
///
/// A running execution only ever moves toward a worse result; see [BuildResult::combine].
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
  #[default]
  Success,
  Unstable,
  Failure,
  NotBuilt,
  Aborted,
}

impl BuildResult {
  /// Returns the worse of the two results.
  pub fn combine(self, other: BuildResult) -> BuildResult {
    self.max(other)
  }

  /// True if `self` is strictly worse than `other`.
  pub fn is_worse_than(self, other: BuildResult) -> bool {
    self > other
  }
}

impl fmt::Display for BuildResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildResult::Success => write!(f, "SUCCESS"),
      BuildResult::Unstable => write!(f, "UNSTABLE"),
      BuildResult::Failure => write!(f, "FAILURE"),
      BuildResult::NotBuilt => write!(f, "NOT_BUILT"),
      BuildResult::Aborted => write!(f, "ABORTED"),
    }
  }
}

impl FromStr for BuildResult {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "SUCCESS" => Ok(BuildResult::Success),
      "UNSTABLE" => Ok(BuildResult::Unstable),
      "FAILURE" => Ok(BuildResult::Failure),
      "NOT_BUILT" => Ok(BuildResult::NotBuilt),
      "ABORTED" => Ok(BuildResult::Aborted),
      other => Err(format!("unknown result '{}'", other)),
    }
  }
}
