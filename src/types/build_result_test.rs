//! Tests for `BuildResult`.

use super::BuildResult;
use proptest::prelude::*;

fn any_result() -> impl Strategy<Value = BuildResult> {
  prop_oneof![
    Just(BuildResult::Success),
    Just(BuildResult::Unstable),
    Just(BuildResult::Failure),
    Just(BuildResult::NotBuilt),
    Just(BuildResult::Aborted),
  ]
}

#[test]
fn ordering_is_success_to_aborted() {
  assert!(BuildResult::Unstable.is_worse_than(BuildResult::Success));
  assert!(BuildResult::Failure.is_worse_than(BuildResult::Unstable));
  assert!(BuildResult::NotBuilt.is_worse_than(BuildResult::Failure));
  assert!(BuildResult::Aborted.is_worse_than(BuildResult::NotBuilt));
}

#[test]
fn combine_picks_worse() {
  assert_eq!(
    BuildResult::Success.combine(BuildResult::Failure),
    BuildResult::Failure
  );
  assert_eq!(
    BuildResult::Aborted.combine(BuildResult::Unstable),
    BuildResult::Aborted
  );
}

#[test]
fn display_and_parse() {
  assert_eq!(BuildResult::NotBuilt.to_string(), "NOT_BUILT");
  assert_eq!("aborted".parse::<BuildResult>(), Ok(BuildResult::Aborted));
  assert!("sideways".parse::<BuildResult>().is_err());
}

#[test]
fn serde_uses_upper_case_names() {
  let json = serde_json::to_string(&BuildResult::Failure).unwrap();
  assert_eq!(json, "\"FAILURE\"");
}

proptest! {
  #[test]
  fn combine_never_improves(start in any_result(), seq in prop::collection::vec(any_result(), 0..32)) {
    let mut current = start;
    for next in seq {
      let combined = current.combine(next);
      prop_assert!(!current.is_worse_than(combined));
      prop_assert!(!next.is_worse_than(combined));
      current = combined;
    }
  }
}
