//! Forge SDK
//!
//! Shared types and errors for the forge engine and the hosts that observe it.
//! A host that only submits tasks and polls their status needs nothing else.

/// Error types and handling
pub mod errors;

/// Task, step and history types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, ErrorExt, ErrorScope, PlanningError};
pub use types::{
    Complexity, ErrorKind, ErrorRecord, ExecutionResult, Experience, Outcome, Step, StepReport,
    StepStatus, Task, TaskReport, TaskStatus, TaskStatusView, VersionEntry,
};
