//! Tests for `Outcome` and `FlowError`.

use super::{BuildResult, FlowError, Outcome, Value};

#[test]
fn interrupted_maps_to_carried_result() {
  let e = FlowError::interrupted(BuildResult::Aborted, "user");
  assert_eq!(e.result(), BuildResult::Aborted);
  assert_eq!(FlowError::error("boom").result(), BuildResult::Failure);
  assert_eq!(FlowError::load_failed("x").result(), BuildResult::Failure);
}

#[test]
fn catch_value_exposes_message_and_type() {
  let v = FlowError::error("boom").to_value();
  let m = v.as_map().unwrap();
  assert_eq!(m.get("message"), Some(&Value::str("boom")));
  assert_eq!(m.get("type"), Some(&Value::str("error")));
}

#[test]
fn outcome_accessors() {
  let ok = Outcome::Normal(Value::Int(3));
  assert!(!ok.is_failure());
  assert_eq!(ok.value(), Some(&Value::Int(3)));
  let bad: Outcome = Err(FlowError::error("x")).into();
  assert!(bad.is_failure());
  assert_eq!(bad.error().map(|e| e.to_string()), Some("x".to_string()));
}

#[test]
fn outcome_serializes_with_error_kind_tag() {
  let o = Outcome::Abnormal(FlowError::interrupted(BuildResult::Aborted, "stop"));
  let json = serde_json::to_string(&o).unwrap();
  assert!(json.contains("\"kind\":\"interrupted\""));
  let back: Outcome = serde_json::from_str(&json).unwrap();
  assert_eq!(back, o);
}
