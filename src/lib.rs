//! # cps-flow
//!
//! A durable pipeline engine. Scripts compile to a small continuation-passing
//! VM whose state can be saved between steps, so a run survives a restart of
//! the process that hosts it.
//!
//! ## Architecture
//!
//! - [Engine] holds step, pickle and context registries and starts or loads
//!   runs.
//! - [CpsFlowExecution] owns one run: its flow graph, heads, console and
//!   lifecycle state.
//! - [thread_group::CpsThreadGroup] runs all of a run's threads on a single
//!   lane ([vm_executor]), one chunk at a time.
//! - [steps] contains the built-in DSL steps (`echo`, `parallel`, `sleep`,
//!   `waitForSignal`, ...).
//! - [storage] persists the flow graph, and [program_io] the program state.

pub mod config;
pub mod console;
pub mod context_vars;
#[cfg(test)]
mod context_vars_test;
pub mod continuation;
#[cfg(test)]
mod continuation_test;
pub mod engine;
pub mod error;
pub mod execution;
pub mod execution_io;
pub mod flow_head;
pub mod graph;
pub mod json_io;
#[cfg(test)]
mod json_io_test;
pub mod pickle;
pub mod program_io;
#[cfg(test)]
mod program_io_test;
pub mod script;
pub mod step;
pub mod steps;
pub mod storage;
pub mod thread;
pub mod thread_dump;
pub mod thread_group;
pub mod timing;
pub mod types;
pub mod vm_executor;

pub use config::EngineConfig;
pub use context_vars::{ContextLookup, ContextVariableSet, DynamicContext};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, PersistError, StepError, StorageError};
pub use execution::{CpsFlowExecution, GraphListener, StartOptions};
pub use flow_head::FlowHead;
pub use pickle::{PickleFactory, PickleResolver};
pub use step::{BodyOptions, Step, StepContext, StepExecution};
pub use thread_dump::{ThreadDump, ThreadInfo};
pub use thread_group::{CurrentStep, ThreadSummary};
pub use timing::TimingKind;
pub use types::{
  Action, BuildResult, Closure, ExecutionState, FlowDurabilityHint, FlowError, FlowNode, LiveHandle, LiveResource,
  NodeKind, Outcome, Pickle, StepArguments, Value,
};
