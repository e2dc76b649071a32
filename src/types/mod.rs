//! Core data types shared by the continuation VM, the graph, and persistence.

mod arguments;
mod build_result;
#[cfg(test)]
mod build_result_test;
mod durability;
mod execution_state;
mod flow_node;
mod outcome;
#[cfg(test)]
mod outcome_test;
mod value;
#[cfg(test)]
mod value_test;

pub use arguments::StepArguments;
pub use build_result::BuildResult;
pub use durability::FlowDurabilityHint;
pub use execution_state::ExecutionState;
pub use flow_node::{Action, FlowNode, NodeKind};
pub use outcome::{FlowError, Outcome};
pub use value::{Closure, CodeRef, LiveHandle, LiveResource, Pickle, Value};
