//! Task, step and history types
//!
//! These are the records the engine persists and hands back to callers.
//! Status enums serialize as snake_case strings, the same form the database
//! stores, so `as_str` and `FromStr` agree with serde.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    PlanFailed,
    Executing,
    Completed,
    PartiallyCompleted,
    Aborted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::PlanFailed => "plan_failed",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::PartiallyCompleted => "partially_completed",
            TaskStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::PlanFailed
                | TaskStatus::Completed
                | TaskStatus::PartiallyCompleted
                | TaskStatus::Aborted
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Planning) => true,
            (Planning, PlanFailed) | (Planning, Executing) => true,
            (Executing, Completed) | (Executing, PartiallyCompleted) => true,
            // A failed history write can end the task from any live state
            (Pending | Planning | Executing, Aborted) => true,
            _ => false,
        }
    }

    /// Terminal status of a task whose plan ran to the end
    ///
    /// `Completed` only if every step succeeded. An empty slice cannot occur
    /// for an executed plan and rolls up to `PartiallyCompleted`.
    pub fn roll_up(steps: &[StepStatus]) -> TaskStatus {
        if !steps.is_empty() && steps.iter().all(|s| *s == StepStatus::Succeeded) {
            TaskStatus::Completed
        } else {
            TaskStatus::PartiallyCompleted
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "planning" => Ok(TaskStatus::Planning),
            "plan_failed" => Ok(TaskStatus::PlanFailed),
            "executing" => Ok(TaskStatus::Executing),
            "completed" => Ok(TaskStatus::Completed),
            "partially_completed" => Ok(TaskStatus::PartiallyCompleted),
            "aborted" => Ok(TaskStatus::Aborted),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    FixExhausted,
    SafetyViolation,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::FixExhausted => "fix_exhausted",
            StepStatus::SafetyViolation => "safety_violation",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "succeeded" => Ok(StepStatus::Succeeded),
            "fix_exhausted" => Ok(StepStatus::FixExhausted),
            "safety_violation" => Ok(StepStatus::SafetyViolation),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status: {}", other)),
        }
    }
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Timeout,
    Exception,
    SafetyViolation,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Timeout => "timeout",
            Outcome::Exception => "exception",
            Outcome::SafetyViolation => "safety_violation",
        }
    }

    /// Timeouts and exceptions go to the repair loop; violations never do
    pub fn is_repairable(&self) -> bool {
        matches!(self, Outcome::Timeout | Outcome::Exception)
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "timeout" => Ok(Outcome::Timeout),
            "exception" => Ok(Outcome::Exception),
            "safety_violation" => Ok(Outcome::SafetyViolation),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

/// Classified failure kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingDependency,
    NameReference,
    Attribute,
    TypeMismatch,
    ValueError,
    Lookup,
    Syntax,
    Indentation,
    DivisionByZero,
    FileNotFound,
    Permission,
    AssertionFailure,
    ResourceTimeout,
    GenerationFailure,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 15] = [
        ErrorKind::MissingDependency,
        ErrorKind::NameReference,
        ErrorKind::Attribute,
        ErrorKind::TypeMismatch,
        ErrorKind::ValueError,
        ErrorKind::Lookup,
        ErrorKind::Syntax,
        ErrorKind::Indentation,
        ErrorKind::DivisionByZero,
        ErrorKind::FileNotFound,
        ErrorKind::Permission,
        ErrorKind::AssertionFailure,
        ErrorKind::ResourceTimeout,
        ErrorKind::GenerationFailure,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingDependency => "missing_dependency",
            ErrorKind::NameReference => "name_reference",
            ErrorKind::Attribute => "attribute",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::ValueError => "value_error",
            ErrorKind::Lookup => "lookup",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Indentation => "indentation",
            ErrorKind::DivisionByZero => "division_by_zero",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::Permission => "permission",
            ErrorKind::AssertionFailure => "assertion_failure",
            ErrorKind::ResourceTimeout => "resource_timeout",
            ErrorKind::GenerationFailure => "generation_failure",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown error kind: {}", s))
    }
}

/// One submitted natural-language request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub task_type: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

/// One planned unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub task_id: String,
    pub sequence_index: u32,
    /// Identifier the planner used for this step ("step_1", ...)
    pub key: String,
    pub description: String,
    /// Ids of the steps this one consumes
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    pub artifact: Option<String>,
    pub fix_attempts_used: u32,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

/// Captured result of one execution attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub step_id: String,
    pub attempt_number: u32,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub duration_ms: u64,
    pub outcome: Outcome,
}

/// Classified failure of one attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub step_id: String,
    pub task_id: String,
    pub attempt_number: u32,
    pub error_kind: ErrorKind,
    pub message: String,
    pub derived_fix_description: String,
    /// Set once a later attempt of the same step succeeded
    pub fixed: bool,
}

/// A past outcome available for similarity retrieval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experience {
    pub id: i64,
    pub task_id: String,
    pub step_id: Option<String>,
    pub task_type: String,
    pub pattern: String,
    pub outcome: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    /// Distance to the query that retrieved this record
    pub distance: Option<f32>,
    pub created_at: i64,
}

/// Snapshot of one accepted artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionEntry {
    pub id: i64,
    pub task_id: String,
    pub step_id: String,
    /// Position in the task's chain, starting at 1
    pub sequence: u32,
    pub artifact: String,
    pub artifact_hash: String,
    pub commit_message: String,
    pub created_at: i64,
}

/// Rough size of a plan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn from_step_count(steps: usize) -> Self {
        match steps {
            0..=3 => Complexity::Simple,
            4..=8 => Complexity::Moderate,
            _ => Complexity::Complex,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step line of a task report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepReport {
    pub step_id: String,
    pub sequence_index: u32,
    pub description: String,
    pub status: StepStatus,
    pub error_kind: Option<ErrorKind>,
    pub fix_attempts_used: u32,
    pub attempts: u32,
    pub error: Option<String>,
    pub output_tail: Option<String>,
}

/// Structured record of a task, returned by `get_result`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReport {
    pub task: Task,
    pub complexity: Option<Complexity>,
    pub steps: Vec<StepReport>,
    pub versions: usize,
}

impl TaskReport {
    pub fn succeeded_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count()
    }
}

/// Live view returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    /// Sequence index and description of the step in progress
    pub current_step: Option<(u32, String)>,
    pub log_tail: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_transitions_follow_state_machine() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Planning));
        assert!(TaskStatus::Planning.can_transition_to(TaskStatus::PlanFailed));
        assert!(TaskStatus::Executing.can_transition_to(TaskStatus::PartiallyCompleted));
        assert!(TaskStatus::Executing.can_transition_to(TaskStatus::Aborted));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Executing));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Aborted));
        assert!(!TaskStatus::PlanFailed.can_transition_to(TaskStatus::Executing));
    }

    #[test]
    fn test_roll_up() {
        assert_eq!(
            TaskStatus::roll_up(&[StepStatus::Succeeded, StepStatus::Succeeded]),
            TaskStatus::Completed
        );
        assert_eq!(
            TaskStatus::roll_up(&[StepStatus::Succeeded, StepStatus::Skipped]),
            TaskStatus::PartiallyCompleted
        );
        assert_eq!(TaskStatus::roll_up(&[]), TaskStatus::PartiallyCompleted);
    }

    #[test]
    fn test_status_serde_matches_as_str() {
        let json = serde_json::to_string(&TaskStatus::PartiallyCompleted).unwrap();
        assert_eq!(json, "\"partially_completed\"");
        let json = serde_json::to_string(&StepStatus::FixExhausted).unwrap();
        assert_eq!(json, "\"fix_exhausted\"");
        let json = serde_json::to_string(&ErrorKind::NameReference).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorKind::NameReference.as_str()));
    }

    #[test]
    fn test_only_timeout_and_exception_are_repairable() {
        assert!(Outcome::Timeout.is_repairable());
        assert!(Outcome::Exception.is_repairable());
        assert!(!Outcome::SafetyViolation.is_repairable());
        assert!(!Outcome::Success.is_repairable());
    }

    #[test]
    fn test_complexity_buckets() {
        assert_eq!(Complexity::from_step_count(1), Complexity::Simple);
        assert_eq!(Complexity::from_step_count(3), Complexity::Simple);
        assert_eq!(Complexity::from_step_count(4), Complexity::Moderate);
        assert_eq!(Complexity::from_step_count(8), Complexity::Moderate);
        assert_eq!(Complexity::from_step_count(9), Complexity::Complex);
    }
}
