//! Per-run console log (`<run_dir>/log`).

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const LOG_FILENAME: &str = "log";

/// Appends lines to the run's console log. Writes are serialized.
#[derive(Debug)]
pub struct Console {
  path: PathBuf,
  lock: Mutex<()>,
}

impl Console {
  pub fn new(run_dir: &Path) -> Self {
    Self {
      path: run_dir.join(LOG_FILENAME),
      lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Appends `line`. Failures are logged, never returned: console output must not fail a run.
  pub fn println(&self, line: &str) {
    info!(target: "cps_flow::console", "{}", line);
    let _guard = self.lock.lock();
    if let Err(e) = self.append(line) {
      warn!(path = %self.path.display(), error = %e, "could not write console log");
    }
  }

  fn append(&self, line: &str) -> io::Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
    writeln!(f, "{}", line)
  }

  /// Full log contents, or empty when nothing was written yet.
  pub fn read(&self) -> String {
    std::fs::read_to_string(&self.path).unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::Console;

  #[test]
  fn appends_lines() {
    let dir = tempfile::tempdir().unwrap();
    let c = Console::new(dir.path());
    assert_eq!(c.read(), "");
    c.println("Resuming build");
    c.println("hello");
    assert_eq!(c.read(), "Resuming build\nhello\n");
  }
}
