use super::with_env::parse_overrides;
use crate::types::Value;

#[test]
fn splits_on_first_equals() {
  let parsed = parse_overrides(&[Value::str("A=1"), Value::str("URL=http://x?a=b"), Value::str("EMPTY")]).unwrap();
  assert_eq!(parsed["A"], "1");
  assert_eq!(parsed["URL"], "http://x?a=b");
  assert_eq!(parsed["EMPTY"], "");
  assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["A", "URL", "EMPTY"]);
}

#[test]
fn rejects_non_strings_and_empty_names() {
  assert!(parse_overrides(&[Value::Int(1)]).is_err());
  let err = parse_overrides(&[Value::str("=x")]).unwrap_err();
  assert!(err.to_string().contains("empty variable name"));
}
