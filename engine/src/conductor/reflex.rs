//! Reflex: classify a failed attempt and produce a patched artifact
//!
//! Classification is a closed set of substring rules over the captured
//! error text, checked in a fixed order. Repair goes through the generator;
//! when the model returns no usable code a small set of mechanical fixes is
//! tried before giving up on the attempt.
//!
//! Safety violations never reach this module.

use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::{ErrorKind, ErrorRecord, ExecutionResult, Outcome, Step};
use std::sync::{Arc, OnceLock};

use crate::conductor::generator::{extract_code, fenced_blocks, Generator, RepairRequest};

/// Ordered classification rules; the first rule with a matching needle wins
const CLASSIFICATION_RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Indentation,
        &["indentationerror", "taberror", "unexpected indent", "unindent does not match"],
    ),
    (ErrorKind::Syntax, &["syntaxerror", "syntax error"]),
    (
        ErrorKind::MissingDependency,
        &["modulenotfounderror", "importerror", "no module named"],
    ),
    (
        ErrorKind::NameReference,
        &[
            "nameerror",
            "unboundlocalerror",
            "is not defined",
            "command not found",
            ": not found",
        ],
    ),
    (ErrorKind::Attribute, &["attributeerror", "has no attribute"]),
    (ErrorKind::TypeMismatch, &["typeerror"]),
    (ErrorKind::DivisionByZero, &["zerodivisionerror", "division by zero"]),
    (
        ErrorKind::Lookup,
        &["indexerror", "keyerror", "index out of range"],
    ),
    (ErrorKind::ValueError, &["valueerror"]),
    (
        ErrorKind::FileNotFound,
        &["filenotfounderror", "no such file or directory"],
    ),
    (ErrorKind::Permission, &["permissionerror", "permission denied"]),
    (ErrorKind::AssertionFailure, &["assertionerror", "assertion failed"]),
];

/// Lines of stderr considered when the error message alone is inconclusive
const CLASSIFY_TAIL_LINES: usize = 20;

/// Classify a failed execution
pub fn classify(result: &ExecutionResult) -> ErrorKind {
    if result.outcome == Outcome::Timeout {
        return ErrorKind::ResourceTimeout;
    }

    let kind = classify_text(&extract_error_message(result));
    if kind != ErrorKind::Unknown {
        return kind;
    }

    let lines: Vec<&str> = result.stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(CLASSIFY_TAIL_LINES)..].join("\n");
    classify_text(&tail)
}

pub fn classify_text(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// One-line description of a failure
///
/// The last line of a Python traceback, else the last non-empty stderr
/// line, else the exit status.
pub fn extract_error_message(result: &ExecutionResult) -> String {
    if result.outcome == Outcome::Timeout {
        return format!("Execution timed out after {}ms", result.duration_ms);
    }

    let lines: Vec<&str> = result
        .stderr
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty() && !l.starts_with("... (truncated"))
        .collect();

    if let Some(start) = lines
        .iter()
        .rposition(|l| l.starts_with("Traceback (most recent call last)"))
    {
        if let Some(last) = lines[start + 1..].last() {
            return last.trim().to_string();
        }
    }
    if let Some(last) = lines.last() {
        return last.trim().to_string();
    }

    match (result.exit_code, result.exit_signal) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(signal)) => format!("terminated by signal {}", signal),
        (None, None) => "process failed without output".to_string(),
    }
}

/// Parsed CAUSE / FIX / EXPLANATION response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixAnalysis {
    pub cause: String,
    pub fixed_code: String,
    pub explanation: String,
}

fn section_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?i)^[ \t*]*(cause|fix|explanation)[ \t]*:\**[ \t]*(.*)$")
            .expect("Invalid section marker pattern")
    })
}

/// Split a repair response into its sections
///
/// Markers inside fenced blocks are ignored. Without a FIX section the first
/// fenced block anywhere in the response is taken as the fixed code.
pub fn parse_analysis(text: &str) -> FixAnalysis {
    #[derive(Clone, Copy, PartialEq)]
    enum Section {
        Cause,
        Fix,
        Explanation,
    }

    let mut cause = Vec::new();
    let mut fix = Vec::new();
    let mut explanation = Vec::new();
    let mut current: Option<Section> = None;
    let mut in_fence = false;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some(caps) = section_marker().captures(line) {
                let name = caps.get(1).map(|m| m.as_str().to_lowercase());
                current = match name.as_deref() {
                    Some("cause") => Some(Section::Cause),
                    Some("fix") => Some(Section::Fix),
                    _ => Some(Section::Explanation),
                };
                let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                match current {
                    Some(Section::Cause) => cause.push(rest),
                    Some(Section::Fix) => fix.push(rest),
                    _ => explanation.push(rest),
                }
                continue;
            }
        }

        match current {
            Some(Section::Cause) => cause.push(line),
            Some(Section::Fix) => fix.push(line),
            Some(Section::Explanation) => explanation.push(line),
            None => {}
        }
    }

    let fix_blocks = fenced_blocks(&fix.join("\n"));
    let fixed_code = fix_blocks
        .into_iter()
        .find(|b| !b.is_empty())
        .or_else(|| fenced_blocks(text).into_iter().find(|b| !b.is_empty()))
        .unwrap_or_default();

    FixAnalysis {
        cause: cause.join("\n").trim().to_string(),
        fixed_code,
        explanation: explanation.join("\n").trim().to_string(),
    }
}

/// Mechanical repair for when the model offers no code
///
/// Returns the patched artifact and a description of the change.
pub fn heuristic_fix(kind: ErrorKind, artifact: &str, message: &str) -> Option<(String, String)> {
    match kind {
        ErrorKind::Indentation => {
            let fixed = normalize_indentation(artifact);
            (fixed != artifact).then(|| (fixed, "Normalized indentation to multiples of 4".to_string()))
        }
        ErrorKind::MissingDependency => {
            static MODULE: OnceLock<Regex> = OnceLock::new();
            let module = MODULE
                .get_or_init(|| {
                    Regex::new(r#"No module named ['"]([\w.]+)['"]"#)
                        .expect("Invalid missing module pattern")
                })
                .captures(message)?
                .get(1)?
                .as_str();
            Some((
                format!("# NOTE: Install missing module: pip install {}\n\n{}", module, artifact),
                format!("Noted missing module {}", module),
            ))
        }
        _ => None,
    }
}

fn normalize_indentation(code: &str) -> String {
    code.lines()
        .map(|line| {
            if line.trim().is_empty() {
                return line.to_string();
            }
            let body = line.trim_start();
            let indent: usize = line[..line.len() - body.len()]
                .chars()
                .map(|c| if c == '\t' { 4 } else { 1 })
                .sum();
            format!("{}{}", " ".repeat((indent / 4) * 4), body)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Verdict on a proposed fix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixValidation {
    pub valid: bool,
    pub reason: Option<String>,
    pub concerns: Vec<String>,
}

pub fn validate_fix(original: &str, fixed: &str) -> FixValidation {
    if fixed.trim().is_empty() {
        return FixValidation {
            valid: false,
            reason: Some("Fixed code is empty".to_string()),
            concerns: Vec::new(),
        };
    }
    if fixed.trim() == original.trim() {
        return FixValidation {
            valid: false,
            reason: Some("Fixed code is identical to original".to_string()),
            concerns: Vec::new(),
        };
    }

    let mut concerns = Vec::new();
    if fixed.contains("# TODO") || fixed.contains("# FIXME") {
        concerns.push("Fixed code contains TODO/FIXME comments".to_string());
    }
    if has_pass(fixed) && !has_pass(original) {
        concerns.push("Fixed code adds 'pass' statements".to_string());
    }
    for concern in &concerns {
        tracing::warn!("{}", concern);
    }

    FixValidation {
        valid: true,
        reason: None,
        concerns,
    }
}

fn has_pass(code: &str) -> bool {
    code.lines().any(|l| l.trim() == "pass")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryApproach {
    Standard,
    InstallDependencies,
    SimplifyCode,
    AlternativeSolution,
}

impl RetryApproach {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryApproach::Standard => "standard",
            RetryApproach::InstallDependencies => "install_dependencies",
            RetryApproach::SimplifyCode => "simplify_code",
            RetryApproach::AlternativeSolution => "alternative_solution",
        }
    }

    /// Extra instruction for the repair prompt
    pub fn instruction(&self) -> Option<&'static str> {
        match self {
            RetryApproach::Standard => None,
            RetryApproach::InstallDependencies => Some(
                "The missing module cannot be installed here. Rewrite the code to use only the standard library.",
            ),
            RetryApproach::SimplifyCode => Some(
                "Earlier fixes kept failing to parse. Rewrite the code with a simpler structure.",
            ),
            RetryApproach::AlternativeSolution => Some(
                "The same error keeps recurring. Try a completely different approach.",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategy {
    pub approach: RetryApproach,
    pub modifications: Vec<String>,
}

/// Pick a repair approach from the failures so far, oldest first
pub fn retry_strategy(previous_messages: &[String]) -> RetryStrategy {
    let lower: Vec<String> = previous_messages.iter().map(|m| m.to_lowercase()).collect();

    let (approach, modification) = if lower.is_empty() {
        (RetryApproach::Standard, None)
    } else if lower.iter().all(|m| m.contains("import") || m.contains("no module named")) {
        (
            RetryApproach::InstallDependencies,
            Some("Avoid missing dependencies"),
        )
    } else if lower.iter().all(|m| m.contains("syntax")) {
        (RetryApproach::SimplifyCode, Some("Simplify code structure"))
    } else if lower.len() >= 2 && lower[lower.len() - 1] == lower[lower.len() - 2] {
        (
            RetryApproach::AlternativeSolution,
            Some("Try completely different approach"),
        )
    } else {
        (RetryApproach::Standard, None)
    };

    RetryStrategy {
        approach,
        modifications: modification.map(str::to_string).into_iter().collect(),
    }
}

/// Record of a generation failure, which has no execution to classify
pub fn generation_failure(step: &Step, attempt: u32, error: &EngineError) -> ErrorRecord {
    ErrorRecord {
        step_id: step.id.clone(),
        task_id: step.task_id.clone(),
        attempt_number: attempt,
        error_kind: ErrorKind::GenerationFailure,
        message: error.to_string(),
        derived_fix_description: "Regenerate the artifact".to_string(),
        fixed: false,
    }
}

/// Record of the failure that used up a step's fix budget
pub fn final_failure(step: &Step, attempt: u32, result: &ExecutionResult) -> ErrorRecord {
    ErrorRecord {
        step_id: step.id.clone(),
        task_id: step.task_id.clone(),
        attempt_number: attempt,
        error_kind: classify(result),
        message: extract_error_message(result),
        derived_fix_description: "No repair attempted, fix budget exhausted".to_string(),
        fixed: false,
    }
}

/// Outcome of diagnosing one failed attempt
#[derive(Debug)]
pub struct Diagnosis {
    /// The failure, ready to append to the error log
    pub record: ErrorRecord,
    /// Artifact for the next attempt, or why there is none
    pub patched: Result<String, EngineError>,
}

pub struct Reflex {
    generator: Arc<Generator>,
}

impl Reflex {
    pub fn new(generator: Arc<Generator>) -> Self {
        Self { generator }
    }

    /// Classify a failed attempt and ask for a patched artifact
    ///
    /// `history` holds the step's earlier failures, oldest first.
    pub async fn diagnose(
        &self,
        step: &Step,
        attempt: u32,
        result: &ExecutionResult,
        artifact: &str,
        history: &[ErrorRecord],
    ) -> Diagnosis {
        let kind = classify(result);
        let message = extract_error_message(result);
        tracing::info!("Attempt {} of step {} failed: {} ({})", attempt, step.sequence_index + 1, message, kind);

        let mut messages: Vec<String> = history.iter().map(|r| r.message.clone()).collect();
        messages.push(message.clone());
        let strategy = retry_strategy(&messages);

        let request = RepairRequest {
            artifact: artifact.to_string(),
            error_kind: kind,
            message: message.clone(),
            stderr: result.stderr.clone(),
            history: history.to_vec(),
            strategy: strategy.clone(),
        };

        let mut description = None;
        let candidate = match self.generator.repair(step, &request).await {
            Ok(text) => {
                let analysis = parse_analysis(&text);
                description = [&analysis.explanation, &analysis.cause]
                    .into_iter()
                    .find(|s| !s.is_empty())
                    .cloned();
                if analysis.fixed_code.is_empty() {
                    tracing::warn!("No fixed code in analysis, trying mechanical fix");
                    self.fallback(kind, artifact, &message, &mut description)
                } else {
                    extract_code(&analysis.fixed_code, self.generator.max_code_length())
                }
            }
            Err(e) => {
                tracing::warn!("Repair request failed: {}", e);
                self.fallback(kind, artifact, &message, &mut description)
                    .map_err(|_| e)
            }
        };

        let patched = candidate.and_then(|code| {
            let validation = validate_fix(artifact, &code);
            if validation.valid {
                Ok(code)
            } else {
                let reason = validation.reason.unwrap_or_default();
                tracing::warn!("Rejected fix: {}", reason);
                Err(EngineError::Generation(format!("Invalid fix: {}", reason)))
            }
        });

        let derived_fix_description = description.unwrap_or_else(|| match strategy.approach {
            RetryApproach::Standard => format!("Repair {} error", kind),
            approach => format!("Repair {} error ({})", kind, approach.as_str()),
        });

        Diagnosis {
            record: ErrorRecord {
                step_id: step.id.clone(),
                task_id: step.task_id.clone(),
                attempt_number: attempt,
                error_kind: kind,
                message,
                derived_fix_description,
                fixed: false,
            },
            patched,
        }
    }

    fn fallback(
        &self,
        kind: ErrorKind,
        artifact: &str,
        message: &str,
        description: &mut Option<String>,
    ) -> Result<String, EngineError> {
        match heuristic_fix(kind, artifact, message) {
            Some((code, what)) => {
                *description = Some(what);
                Ok(code)
            }
            None => Err(EngineError::Generation(
                "Model returned no fixed code".to_string(),
            )),
        }
    }
}
