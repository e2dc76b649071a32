//! Per-run durability hint: trades crash safety against write throughput.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowDurabilityHint {
  /// Every node and every suspension point is written atomically.
  #[default]
  MaxSurvivability,
  /// Same write points as `MaxSurvivability`, without the temp-file-and-rename dance.
  SurvivableNonatomic,
  /// Nodes are batched in memory and the program is only written on quiet-down or suspend.
  PerformanceOptimized,
}

impl FlowDurabilityHint {
  /// Whether nodes and program state are persisted as soon as they change.
  pub fn persist_with_every_step(self) -> bool {
    !matches!(self, FlowDurabilityHint::PerformanceOptimized)
  }

  /// Whether files are written through a temp file and renamed into place.
  pub fn atomic_write(self) -> bool {
    !matches!(self, FlowDurabilityHint::SurvivableNonatomic)
  }
}

impl fmt::Display for FlowDurabilityHint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FlowDurabilityHint::MaxSurvivability => write!(f, "MAX_SURVIVABILITY"),
      FlowDurabilityHint::SurvivableNonatomic => write!(f, "SURVIVABLE_NONATOMIC"),
      FlowDurabilityHint::PerformanceOptimized => write!(f, "PERFORMANCE_OPTIMIZED"),
    }
  }
}

impl FromStr for FlowDurabilityHint {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().replace('-', "_").as_str() {
      "MAX_SURVIVABILITY" => Ok(FlowDurabilityHint::MaxSurvivability),
      "SURVIVABLE_NONATOMIC" => Ok(FlowDurabilityHint::SurvivableNonatomic),
      "PERFORMANCE_OPTIMIZED" => Ok(FlowDurabilityHint::PerformanceOptimized),
      other => Err(format!("unknown durability hint '{}'", other)),
    }
  }
}
