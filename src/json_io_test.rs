//! Tests for JSON file helpers.

use crate::json_io::{read_json, remove_if_exists, write_json};
use crate::types::{FlowNode, NodeKind};

#[test]
fn atomic_write_roundtrip_leaves_no_temp_files() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("nested").join("2.json");
  let node = FlowNode::new("2", NodeKind::FlowStart, vec![]);
  write_json(&path, &node, true).unwrap();
  write_json(&path, &node, true).unwrap();
  let loaded: FlowNode = read_json(&path).unwrap();
  assert_eq!(loaded, node);
  let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
  assert_eq!(entries.len(), 1);
}

#[test]
fn non_atomic_write_roundtrip() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("3.json");
  let node = FlowNode::new(
    "3",
    NodeKind::Atom {
      function: "echo".into(),
    },
    vec!["2".into()],
  );
  write_json(&path, &node, false).unwrap();
  assert_eq!(read_json::<FlowNode>(&path).unwrap(), node);
}

#[test]
fn read_missing_or_corrupt_is_error() {
  let dir = tempfile::tempdir().unwrap();
  let missing = dir.path().join("nope.json");
  assert_eq!(
    read_json::<FlowNode>(&missing).unwrap_err().kind(),
    std::io::ErrorKind::NotFound
  );
  let bad = dir.path().join("bad.json");
  std::fs::write(&bad, b"{ not json").unwrap();
  assert_eq!(
    read_json::<FlowNode>(&bad).unwrap_err().kind(),
    std::io::ErrorKind::InvalidData
  );
  remove_if_exists(&bad).unwrap();
  remove_if_exists(&bad).unwrap();
  assert!(!bad.exists());
}
