//! Error types and handling
//!
//! This module provides the closed error taxonomy used throughout the forge
//! engine. Every variant implements the `ErrorExt` trait, which provides a
//! user-facing hint, a recoverability flag and the scope the error is fatal to.
//!
//! # Scope
//!
//! The orchestrator decides how a failure rolls up from its scope alone:
//!
//! - **Attempt**: consumes one unit of the step's fix budget
//!   (`Generation`, `ExecutionTimeout`, `ExecutionException`)
//! - **Step**: terminal for the step, dependents are skipped
//!   (`SafetyViolation`, `FixExhausted`)
//! - **Task**: terminal for the whole task (`Planning`, `MemoryWrite`)
//! - **None**: degrades silently (`MemoryRead`)

use thiserror::Error;

/// What part of a task an error is fatal to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Not fatal to anything; the caller degrades
    None,
    /// Fatal to one attempt; the step budget decides what happens next
    Attempt,
    /// Fatal to one step
    Step,
    /// Fatal to the task
    Task,
}

/// Trait for forge error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried within the step's budget.
    fn is_recoverable(&self) -> bool;

    /// Returns the scope the error is fatal to
    fn scope(&self) -> ErrorScope;
}

/// Reasons a plan is rejected before any step runs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Plan is empty")]
    EmptyPlan,

    #[error("Plan could not be parsed: {0}")]
    Unparsable(String),

    #[error("Plan has too many steps ({count} > {max})")]
    TooManySteps { count: usize, max: usize },

    #[error("Duplicate step id in plan: {0}")]
    DuplicateStepId(String),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Plan dependencies contain a cycle through: {}", steps.join(", "))]
    Cycle { steps: Vec<String> },

    #[error("Inference failed while planning: {0}")]
    Inference(String),
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorExt, ErrorScope};
///
/// let error = EngineError::FixExhausted { attempts: 3 };
/// assert_eq!(error.scope(), ErrorScope::Step);
/// assert!(!error.is_recoverable());
///
/// let read = EngineError::MemoryRead("index offline".to_string());
/// assert_eq!(read.scope(), ErrorScope::None);
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Inference port errors
    #[error("Inference error: {0}")]
    Inference(String),

    // Task pipeline errors
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Execution timed out after {timeout_secs}s")]
    ExecutionTimeout { timeout_secs: u64 },

    #[error("Execution raised an exception: {0}")]
    ExecutionException(String),

    #[error("Fix budget exhausted after {attempts} attempts")]
    FixExhausted { attempts: u32 },

    // Memory errors
    #[error("Memory write failed: {0}")]
    MemoryWrite(String),

    #[error("Memory read failed: {0}")]
    MemoryRead(String),

    // Lookup errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already running: {0}")]
    TaskAlreadyRunning(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Database operation failed. Check the data directory",
            Self::Inference(_) => "Inference backend unavailable. Check that the model server is running",

            Self::Planning(_) => "The task could not be planned. Try rephrasing it",
            Self::Generation(_) => "The model returned no usable code",
            Self::SafetyViolation(_) => "Generated code used a disallowed operation",
            Self::ExecutionTimeout { .. } => "Generated code ran too long. Consider raising execution.timeout_secs",
            Self::ExecutionException(_) => "Generated code failed at runtime",
            Self::FixExhausted { .. } => "Automatic repair gave up on this step",

            Self::MemoryWrite(_) => "Task history could not be saved. Check disk space and permissions",
            Self::MemoryRead(_) => "Past experiences could not be read",

            Self::TaskNotFound(_) => "No task with that id exists",
            Self::TaskAlreadyRunning(_) => "Wait for the running task to finish",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Generation(_)
            | Self::ExecutionTimeout { .. }
            | Self::ExecutionException(_)
            | Self::MemoryRead(_)
            | Self::Inference(_)
            | Self::TaskAlreadyRunning(_) => true,

            Self::Config(_)
            | Self::Database(_)
            | Self::Planning(_)
            | Self::SafetyViolation(_)
            | Self::FixExhausted { .. }
            | Self::MemoryWrite(_)
            | Self::TaskNotFound(_)
            | Self::Io(_) => false,
        }
    }

    fn scope(&self) -> ErrorScope {
        match self {
            Self::MemoryRead(_) => ErrorScope::None,
            Self::Generation(_) | Self::ExecutionTimeout { .. } | Self::ExecutionException(_) => {
                ErrorScope::Attempt
            }
            Self::SafetyViolation(_) | Self::FixExhausted { .. } => ErrorScope::Step,
            Self::Planning(_) | Self::MemoryWrite(_) => ErrorScope::Task,
            // Ambient errors end the task when they escape to the orchestrator
            Self::Config(_)
            | Self::Database(_)
            | Self::Inference(_)
            | Self::TaskNotFound(_)
            | Self::TaskAlreadyRunning(_)
            | Self::Io(_) => ErrorScope::Task,
        }
    }
}
