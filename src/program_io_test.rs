//! Tests for program state encoding.

use crate::continuation::Continuable;
use crate::pickle::{PickleRegistry, collect_pickles};
use crate::program_io::{PROGRAM_FORMAT_VERSION, ProgramState, encode_program};
use crate::script::MAIN_SCRIPT;
use crate::step::{BodyOptions, PendingBody, SavedContext};
use crate::steps::{LEASE_KIND, LeaseFactory, LeasePool};
use crate::thread::{CompletionHandler, SavedStep, SavedThread};
use crate::types::{LiveHandle, Outcome, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn lease(pool: &LeasePool, resource: &str) -> Value {
  Value::Live(LiveHandle::new(pool.acquire(resource)))
}

/// One thread parked in a step that already signalled a live value and has a
/// body with live arguments still waiting to launch.
fn parked_state(pool: &LeasePool) -> ProgramState {
  let mut context = BTreeMap::new();
  context.insert("LOCK".to_string(), lease(pool, "ctx"));
  ProgramState {
    version: PROGRAM_FORMAT_VERSION,
    iota: 3,
    threads: vec![SavedThread {
      id: 0,
      program: Continuable::for_script(MAIN_SCRIPT),
      head_id: 1,
      resume: None,
      step: Some(SavedStep {
        name: "grab".to_string(),
        node_id: "3".to_string(),
        block: true,
        context: SavedContext {
          id: 2,
          node_id: "3".to_string(),
          outcome: Some(Outcome::Normal(lease(pool, "outcome"))),
          pending_bodies: vec![PendingBody {
            body: Value::Body(1),
            options: BodyOptions {
              label: None,
              context,
              args: vec![lease(pool, "arg")],
            },
          }],
          body_heads: Vec::new(),
          exported: vec![1],
        },
        state: serde_json::Value::Null,
      }),
      variables: Vec::new(),
      completion: CompletionHandler::Program,
    }],
    closures: BTreeMap::new(),
    paused: false,
  }
}

#[test]
fn live_values_held_by_a_suspended_step_are_pickled() {
  let pool = LeasePool::new();
  let mut pickles = PickleRegistry::default();
  pickles.add_factory(Arc::new(LeaseFactory));
  let mut state = parked_state(&pool);

  let bytes = encode_program(&mut state, &pickles).unwrap();
  let mut decoded: ProgramState = serde_json::from_slice(&bytes).unwrap();
  let found = collect_pickles(decoded.values_mut());
  assert_eq!(found.len(), 3);
  assert!(found.iter().all(|p| p.kind == LEASE_KIND));
}

#[test]
fn live_outcome_without_factory_is_rejected() {
  let pool = LeasePool::new();
  let mut state = parked_state(&pool);
  let err = encode_program(&mut state, &PickleRegistry::default()).unwrap_err();
  assert!(err.to_string().contains(LEASE_KIND), "{}", err);
}
