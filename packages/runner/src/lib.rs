// ABOUTME: Runner registry and ephemeral container executor
// ABOUTME: Discovers language runners by image label and runs code in one-shot containers

pub mod executor;
pub mod registry;

pub use executor::{ExecutionOutcome, Executor};
pub use registry::{RegistryError, RunnerInfo, RunnerRegistry};
