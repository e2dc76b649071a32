//! Cumulative time spent per kind of engine work, kept with the owner record.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingKind {
  /// Compiling scripts.
  Parse,
  /// Waiting in the lane queue before a chunk starts.
  RunQueue,
  /// Running chunks.
  Run,
  /// Writing `program.json`.
  SaveProgram,
  /// Storing flow nodes.
  FlowNode,
  /// Reading program state and resolving pickles.
  Load,
}

impl fmt::Display for TimingKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TimingKind::Parse => "parse",
      TimingKind::RunQueue => "run_queue",
      TimingKind::Run => "run",
      TimingKind::SaveProgram => "save_program",
      TimingKind::FlowNode => "flow_node",
      TimingKind::Load => "load",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Default)]
pub struct Timings {
  totals: Mutex<BTreeMap<TimingKind, Duration>>,
}

impl Timings {
  pub fn from_nanos(saved: BTreeMap<TimingKind, u64>) -> Self {
    Self {
      totals: Mutex::new(
        saved
          .into_iter()
          .map(|(k, n)| (k, Duration::from_nanos(n)))
          .collect(),
      ),
    }
  }

  /// Starts timing `kind`; the elapsed time is added when the guard drops.
  pub fn time(&self, kind: TimingKind) -> TimingGuard<'_> {
    TimingGuard {
      timings: self,
      kind,
      started: Instant::now(),
    }
  }

  pub fn add(&self, kind: TimingKind, elapsed: Duration) {
    *self.totals.lock().entry(kind).or_default() += elapsed;
  }

  pub fn snapshot(&self) -> BTreeMap<TimingKind, Duration> {
    self.totals.lock().clone()
  }

  pub fn to_nanos(&self) -> BTreeMap<TimingKind, u64> {
    self
      .totals
      .lock()
      .iter()
      .map(|(k, d)| (*k, u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)))
      .collect()
  }
}

pub struct TimingGuard<'t> {
  timings: &'t Timings,
  kind: TimingKind,
  started: Instant,
}

impl Drop for TimingGuard<'_> {
  fn drop(&mut self) {
    self.timings.add(self.kind, self.started.elapsed());
  }
}

#[cfg(test)]
mod tests {
  use super::{TimingKind, Timings};
  use std::time::Duration;

  #[test]
  fn guard_accumulates() {
    let t = Timings::default();
    t.add(TimingKind::Run, Duration::from_millis(5));
    {
      let _g = t.time(TimingKind::Run);
    }
    assert!(t.snapshot()[&TimingKind::Run] >= Duration::from_millis(5));
    let restored = Timings::from_nanos(t.to_nanos());
    assert_eq!(restored.snapshot(), t.snapshot());
  }
}
