use crate::continuation::{CodeSource, Continuable, Next, Suspension};
use crate::script::{Block, Program, compile};
use crate::types::{CodeRef, FlowError, Outcome, Value};

struct Scripts(Vec<Program>);

impl CodeSource for Scripts {
  fn block(&self, code: &CodeRef) -> Option<&Block> {
    self
      .0
      .iter()
      .find(|p| p.name == code.script)
      .and_then(|p| p.block(code.block))
  }

  fn global(&self, name: &str) -> Option<Value> {
    (name == "answer").then_some(Value::Int(42))
  }
}

fn scripts(src: &str) -> Scripts {
  Scripts(vec![compile("WorkflowScript", src).unwrap()])
}

fn step_name(next: &Next) -> &str {
  match next {
    Next::Suspended(Suspension::Step(call)) => &call.name,
    other => panic!("expected step call, got {:?}", other),
  }
}

#[test]
fn suspends_at_each_step_and_returns_last_value() {
  let code = scripts("echo 'a'\ndef x = echo('b')\nx");
  let mut k = Continuable::for_script("WorkflowScript");
  let mut budget = 1000;

  let first = k.run0(Outcome::null(), &code, &mut budget);
  assert_eq!(step_name(&first), "echo");
  let second = k.run0(Outcome::null(), &code, &mut budget);
  match &second {
    Next::Suspended(Suspension::Step(call)) => {
      assert_eq!(call.line, 2);
      assert_eq!(call.args.get_str("", 0), Some("b"));
    }
    other => panic!("unexpected {:?}", other),
  }
  let done = k.run0(Outcome::Normal(Value::str("returned")), &code, &mut budget);
  assert_eq!(done, Next::Value(Value::str("returned")));
  assert!(!k.is_resumable());
}

#[test]
fn survives_serialization_mid_flight() {
  let code = scripts("def greeting = 'hi'\nsleep 1\necho \"${greeting} ${answer}\"");
  let mut k = Continuable::for_script("WorkflowScript");
  let mut budget = 1000;
  assert_eq!(step_name(&k.run0(Outcome::null(), &code, &mut budget)), "sleep");

  let json = serde_json::to_string(&k).unwrap();
  let mut restored: Continuable = serde_json::from_str(&json).unwrap();
  assert_eq!(restored, k);

  match restored.run0(Outcome::null(), &code, &mut budget) {
    Next::Suspended(Suspension::Step(call)) => {
      assert_eq!(call.args.positional[0], Value::str("hi 42"));
    }
    other => panic!("unexpected {:?}", other),
  }
}

#[test]
fn catch_binds_error_and_continues() {
  let code = scripts("try {\n  boom()\n} catch (e) {\n  echo e.message\n}\n'after'");
  let mut k = Continuable::for_script("WorkflowScript");
  let mut budget = 1000;
  assert_eq!(step_name(&k.run0(Outcome::null(), &code, &mut budget)), "boom");

  let next = k.run0(Outcome::Abnormal(FlowError::error("bang")), &code, &mut budget);
  match &next {
    Next::Suspended(Suspension::Step(call)) => {
      assert_eq!(call.name, "echo");
      assert_eq!(call.args.positional[0], Value::str("bang"));
    }
    other => panic!("unexpected {:?}", other),
  }
  let end = k.run0(Outcome::null(), &code, &mut budget);
  assert_eq!(end, Next::Value(Value::str("after")));
}

#[test]
fn uncaught_error_terminates() {
  let code = scripts("sleep 1");
  let mut k = Continuable::for_script("WorkflowScript");
  let mut budget = 1000;
  k.run0(Outcome::null(), &code, &mut budget);
  let end = k.run0(Outcome::Abnormal(FlowError::error("x")), &code, &mut budget);
  assert_eq!(end, Next::Abnormal(FlowError::error("x")));
  assert!(!k.is_resumable());
}

#[test]
fn local_closures_run_as_frames() {
  let code = scripts("def twice = { echo it\necho it }\ntwice('z')");
  let mut k = Continuable::for_script("WorkflowScript");
  let mut budget = 1000;
  let first = k.run0(Outcome::null(), &code, &mut budget);
  assert_eq!(step_name(&first), "echo");
  assert_eq!(k.frames().len(), 2);
  let trace = k.stack_trace(&code);
  assert_eq!(trace[0], ("WorkflowScript".to_string(), 1));
  assert_eq!(trace[1], ("WorkflowScript".to_string(), 3));
}

#[test]
fn budget_exhaustion_yields_safepoint() {
  let code = scripts("def a = 1\ndef b = 2\ndef c = 3\nc");
  let mut k = Continuable::for_script("WorkflowScript");
  let mut budget = 2;
  assert_eq!(
    k.run0(Outcome::null(), &code, &mut budget),
    Next::Suspended(Suspension::Safepoint)
  );
  let mut more = 1000;
  assert_eq!(
    k.run0(Outcome::Normal(Value::str("ignored")), &code, &mut more),
    Next::Value(Value::Int(3))
  );
}

#[test]
fn failing_continuation_returns_resume_outcome() {
  let code = scripts("");
  let mut k = Continuable::failing();
  let mut budget = 10;
  let err = FlowError::load_failed("missing pickle");
  assert_eq!(
    k.run0(Outcome::Abnormal(err.clone()), &code, &mut budget),
    Next::Abnormal(err)
  );
  assert!(!k.is_resumable());
}

#[test]
fn missing_property_is_a_script_error() {
  let code = scripts("def m = null\nm.x");
  let mut k = Continuable::for_script("WorkflowScript");
  let mut budget = 1000;
  match k.run0(Outcome::null(), &code, &mut budget) {
    Next::Abnormal(FlowError::Error { message }) => {
      assert!(message.contains("null object"), "{}", message)
    }
    other => panic!("unexpected {:?}", other),
  }
}
