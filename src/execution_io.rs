//! Owner record (`execution.json`): what survives about a run outside its program state.

use crate::flow_head::HeadTable;
use crate::json_io::{read_json, write_json};
use crate::storage::StorageKind;
use crate::timing::TimingKind;
use crate::types::{BuildResult, FlowDurabilityHint};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::instrument;
use uuid::Uuid;

pub const EXECUTION_FILENAME: &str = "execution.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
  pub id: Uuid,
  pub script: String,
  /// Scripts brought in by `load`, by generated name, in load order.
  #[serde(default)]
  pub loaded_scripts: IndexMap<String, String>,
  #[serde(default)]
  pub sandbox: bool,
  pub durability: FlowDurabilityHint,
  pub result: BuildResult,
  pub heads: HeadTable,
  /// Last node/head number handed out.
  pub iota: u32,
  pub done: bool,
  /// Whether program state was saved cleanly; unknown when absent.
  #[serde(default)]
  pub persisted_clean: Option<bool>,
  #[serde(default)]
  pub resume_blocked: bool,
  pub storage_kind: StorageKind,
  /// Suffix of the storage directory after `workflow`.
  #[serde(default)]
  pub storage_suffix: String,
  pub started_at: DateTime<Utc>,
  #[serde(default)]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub timings: BTreeMap<TimingKind, u64>,
}

/// Saves the record atomically.
#[instrument(level = "trace", skip(run_dir, record))]
pub fn save_record(run_dir: &Path, record: &ExecutionRecord) -> Result<(), std::io::Error> {
  write_json(&run_dir.join(EXECUTION_FILENAME), record, true)
}

#[instrument(level = "trace", skip(run_dir))]
pub fn load_record(run_dir: &Path) -> Result<ExecutionRecord, std::io::Error> {
  read_json(&run_dir.join(EXECUTION_FILENAME))
}
