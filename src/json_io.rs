//! JSON file helpers shared by node storage, the owner record and program state.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::instrument;

fn invalid_data(e: serde_json::Error) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Writes `value` to `path` as pretty JSON, creating the parent directory.
/// When `atomic`, the bytes go to a temp file in the same directory that is then
/// renamed over `path`, so readers never observe a half-written file.
#[instrument(level = "trace", skip(path, value))]
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T, atomic: bool) -> io::Result<()> {
  let json = serde_json::to_vec_pretty(value).map_err(invalid_data)?;
  write_bytes(path, &json, atomic)
}

/// Writes already-encoded bytes; see [write_json].
#[instrument(level = "trace", skip(path, bytes), fields(len = bytes.len()))]
pub fn write_bytes(path: &Path, bytes: &[u8], atomic: bool) -> io::Result<()> {
  let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
  if let Some(parent) = parent {
    std::fs::create_dir_all(parent)?;
  }
  if !atomic {
    return std::fs::write(path, bytes);
  }
  let mut tmp = match parent {
    Some(dir) => NamedTempFile::new_in(dir)?,
    None => NamedTempFile::new_in(".")?,
  };
  tmp.write_all(bytes)?;
  tmp.as_file().sync_all()?;
  tmp.persist(path).map_err(|e| e.error)?;
  Ok(())
}

/// Reads and parses `path`. Missing files surface as `NotFound`, bad JSON as `InvalidData`.
#[instrument(level = "trace", skip(path))]
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
  let bytes = std::fs::read(path)?;
  serde_json::from_slice(&bytes).map_err(invalid_data)
}

/// Removes `path`, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
  match std::fs::remove_file(path) {
    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
    _ => Ok(()),
  }
}
