//! Conductor System
//!
//! The closed loop: plan a task, generate an artifact per step, check it
//! against the safety policy, execute it, and repair failures until each
//! step settles. `AgentService` is the entry point for hosts.

pub mod executor;
pub mod generator;
pub mod orchestrator;
pub mod planner;
pub mod reflex;
pub mod scaffold;
pub mod service;
pub mod status;

pub use executor::{ExecutionRequest, Executor};
pub use generator::{DependencyContext, Generator};
pub use orchestrator::Orchestrator;
pub use planner::{Plan, Planner};
pub use reflex::Reflex;
pub use service::AgentService;
pub use status::StatusBoard;
