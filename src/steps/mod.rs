//! Built-in DSL steps.
//!
//! Each step is a descriptor implementing [Step] plus an execution type that
//! serializes itself with serde so it survives a restart.

pub mod echo;
pub mod env_var;
pub mod error_step;
pub mod lease;
pub mod load;
pub mod parallel;
pub mod sleep;
pub mod stage;
pub mod wait_for_signal;
pub mod with_env;

#[cfg(test)]
mod lease_test;
#[cfg(test)]
mod sleep_test;
#[cfg(test)]
mod with_env_test;

pub use echo::EchoStep;
pub use env_var::EnvVarStep;
pub use error_step::ErrorStep;
pub use lease::{AcquireStep, LEASE_KIND, Lease, LeaseFactory, LeasePool, LeaseResolver, ReleaseStep};
pub use load::LoadStep;
pub use parallel::ParallelStep;
pub use sleep::SleepStep;
pub use stage::StageStep;
pub use wait_for_signal::{SignalBoard, WaitForSignalStep};
pub use with_env::WithEnvStep;

use crate::error::StepError;
use crate::step::{StepExecution, StepRegistry};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Registers every built-in step.
pub fn register_builtins(registry: &mut StepRegistry) {
  registry.register(Arc::new(EchoStep));
  registry.register(Arc::new(ErrorStep));
  registry.register(Arc::new(SleepStep));
  registry.register(Arc::new(WaitForSignalStep));
  registry.register(Arc::new(ParallelStep));
  registry.register(Arc::new(StageStep));
  registry.register(Arc::new(WithEnvStep));
  registry.register(Arc::new(EnvVarStep));
  registry.register(Arc::new(LoadStep));
  registry.register(Arc::new(AcquireStep));
  registry.register(Arc::new(ReleaseStep));
}

/// Rebuilds a saved execution of type `T`.
pub(crate) fn restore_as<T>(step: &str, state: serde_json::Value) -> Result<Box<dyn StepExecution>, StepError>
where
  T: StepExecution + DeserializeOwned + 'static,
{
  serde_json::from_value::<T>(state)
    .map(|e| Box::new(e) as Box<dyn StepExecution>)
    .map_err(|e| StepError::invalid(step, format!("unreadable saved state: {}", e)))
}
