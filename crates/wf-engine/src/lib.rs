//! weft execution engine.
//!
//! - [`scheduler`] validates a task graph and partitions it into levels
//! - [`orchestrator`] runs the levels, fanning out each level concurrently
//! - [`invoker`] runs one unit with escalating retry strategies
//! - [`registry`] resolves capability names to provisioned capabilities
//! - [`graphs`] covers the approve / modify / execute lifecycle

pub mod capability;
pub mod classifier;
pub mod context;
pub mod graphs;
pub mod invoker;
pub mod orchestrator;
pub mod prompts;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod strategy;

pub use context::EngineContext;
pub use graphs::GraphService;
pub use invoker::{UnitInvoker, UnitOutcome};
pub use orchestrator::ExecutionOrchestrator;
pub use registry::CapabilityRegistry;
pub use scheduler::{levels, validate, ValidationReport};
pub use strategy::RetryStrategy;
