//! Program state file (`program.json`): the live thread group in serializable form.

use crate::error::PersistError;
use crate::json_io::{remove_if_exists, write_bytes};
use crate::pickle::PickleRegistry;
use crate::thread::SavedThread;
use crate::types::{Closure, Outcome, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::instrument;

pub const PROGRAM_FILENAME: &str = "program.json";
pub const PROGRAM_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramState {
  pub version: u32,
  /// Next id the group hands out for threads, closures and step contexts.
  pub iota: u32,
  pub threads: Vec<SavedThread>,
  /// Exported closures by id.
  #[serde(default)]
  pub closures: BTreeMap<u32, Closure>,
  #[serde(default)]
  pub paused: bool,
}

impl ProgramState {
  /// Every value the state holds, in a stable order: per thread its frames,
  /// pending resume value, scopes and suspended step; then exported closures.
  pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
    let threads = self.threads.iter_mut().flat_map(|t| {
      let resume = t.resume.iter_mut().filter_map(|o| match o {
        Outcome::Normal(v) => Some(v),
        Outcome::Abnormal(_) => None,
      });
      let scopes = t.variables.iter_mut().flat_map(|s| s.values.values_mut());
      let step = t.step.iter_mut().flat_map(|s| s.context.values_mut());
      t.program.values_mut().chain(resume).chain(scopes).chain(step)
    });
    let closures = self
      .closures
      .values_mut()
      .flat_map(|c| c.captured.values_mut());
    threads.chain(closures)
  }
}

/// Pickles live values in `state` and encodes it.
#[instrument(level = "trace", skip_all)]
pub fn encode_program(state: &mut ProgramState, pickles: &PickleRegistry) -> Result<Vec<u8>, PersistError> {
  for v in state.values_mut() {
    pickles.pickle(v)?;
  }
  serde_json::to_vec_pretty(state).map_err(PersistError::Serialize)
}

pub fn write_program(path: &Path, bytes: &[u8], atomic: bool) -> Result<(), PersistError> {
  write_bytes(path, bytes, atomic)?;
  Ok(())
}

#[instrument(level = "trace", skip(path))]
pub fn read_program(path: &Path) -> Result<ProgramState, PersistError> {
  let bytes = std::fs::read(path)?;
  serde_json::from_slice(&bytes).map_err(PersistError::Deserialize)
}

pub fn delete_program(path: &Path) -> Result<(), PersistError> {
  remove_if_exists(path)?;
  Ok(())
}
