use super::sleep::sleep_duration;
use crate::types::{StepArguments, Value};
use indexmap::IndexMap;
use std::time::Duration;

fn named(pairs: &[(&str, Value)]) -> StepArguments {
  let map: IndexMap<String, Value> = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
  StepArguments::new(Vec::new(), map)
}

#[test]
fn positional_time_is_seconds() {
  let args = StepArguments::new(vec![Value::Int(3)], IndexMap::new());
  assert_eq!(sleep_duration(&args).unwrap(), Duration::from_secs(3));
}

#[test]
fn named_unit() {
  let args = named(&[("time", Value::Int(250)), ("unit", Value::str("MILLISECONDS"))]);
  assert_eq!(sleep_duration(&args).unwrap(), Duration::from_millis(250));
  let args = named(&[("time", Value::Int(2)), ("unit", Value::str("MINUTES"))]);
  assert_eq!(sleep_duration(&args).unwrap(), Duration::from_secs(120));
}

#[test]
fn rejects_bad_arguments() {
  assert!(sleep_duration(&StepArguments::default()).is_err());
  assert!(sleep_duration(&named(&[("time", Value::Int(-1))])).is_err());
  let err = sleep_duration(&named(&[("time", Value::Int(1)), ("unit", Value::str("FORTNIGHTS"))])).unwrap_err();
  assert!(err.to_string().contains("FORTNIGHTS"));
}
