//! Code generator
//!
//! Turns a step description, plus the accepted artifacts of the steps it
//! depends on, into one executable artifact. Also produces the repair
//! analysis the reflex loop parses.

use crate::config::CoderConfig;
use crate::conductor::reflex::{RetryApproach, RetryStrategy};
use crate::llm::{InferencePort, Message};
use sdk::errors::EngineError;
use sdk::types::{ErrorKind, ErrorRecord, Step};
use std::sync::Arc;

/// Most characters of dependency output quoted into a prompt
const CONTEXT_OUTPUT_CHARS: usize = 2000;

/// Most characters of stderr quoted into a repair prompt
const REPAIR_STDERR_CHARS: usize = 4000;

/// Accepted work of one completed dependency
#[derive(Debug, Clone)]
pub struct DependencyContext {
    pub sequence_index: u32,
    pub description: String,
    pub artifact: String,
    pub stdout_tail: String,
}

/// Everything the model needs to repair a failed artifact
#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub artifact: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub stderr: String,
    /// Earlier failures of the same step, oldest first
    pub history: Vec<ErrorRecord>,
    pub strategy: RetryStrategy,
}

pub struct Generator {
    llm: Arc<InferencePort>,
    config: CoderConfig,
}

impl Generator {
    pub fn new(llm: Arc<InferencePort>, config: CoderConfig) -> Self {
        Self { llm, config }
    }

    pub fn language(&self) -> &str {
        &self.config.language
    }

    pub fn max_code_length(&self) -> usize {
        self.config.max_code_length
    }

    /// Generate the first artifact for a step
    pub async fn generate(
        &self,
        step: &Step,
        context: &[DependencyContext],
    ) -> Result<String, EngineError> {
        tracing::debug!(
            "Generating code for step {} with {} dependencies",
            step.sequence_index + 1,
            context.len()
        );

        let language = &self.config.language;
        let system_prompt = Message::system(format!(
            "You are an expert {language} programmer. Generate clean, efficient code \
            with error handling where appropriate.\n\
            The code runs as a standalone script with no arguments and no input. \
            Print every result to standard output.\n\
            Respond with ONLY the code in a single ```{language} fenced block, no explanations."
        ));

        let mut user_prompt = format!("Task: {}\n", step.description);
        if !context.is_empty() {
            user_prompt.push_str("\nContext from completed steps:\n");
            for dep in context {
                user_prompt.push_str(&format!(
                    "\nStep {} ({}):\n```{}\n{}\n```\n",
                    dep.sequence_index + 1,
                    dep.description,
                    language,
                    dep.artifact
                ));
                if !dep.stdout_tail.trim().is_empty() {
                    user_prompt.push_str(&format!(
                        "Output:\n{}\n",
                        tail_chars(&dep.stdout_tail, CONTEXT_OUTPUT_CHARS)
                    ));
                }
            }
        }
        user_prompt.push_str(&format!(
            "\nGenerate {} code to accomplish this task.",
            language
        ));

        let response = self
            .llm
            .complete(&[system_prompt, Message::user(user_prompt)])
            .await
            .map_err(|e| EngineError::Generation(format!("Inference failed: {}", e)))?;

        let code = extract_code(&response, self.config.max_code_length)?;
        tracing::info!(
            "Generated {} characters of {} code",
            code.chars().count(),
            language
        );
        Ok(code)
    }

    /// Ask for a diagnosis and fixed code
    ///
    /// Returns the raw response, which follows the CAUSE / FIX / EXPLANATION
    /// layout; the reflex loop parses it.
    pub async fn repair(&self, step: &Step, request: &RepairRequest) -> Result<String, EngineError> {
        let language = &self.config.language;
        let system_prompt = Message::system(
            "You are an expert debugger. Analyze errors and provide clear, actionable fixes.",
        );

        let mut user_prompt = format!(
            "The following code for the task \"{}\" produced an error:\n\n```{}\n{}\n```\n\n\
            Error ({}): {}\n",
            step.description, language, request.artifact, request.error_kind, request.message
        );
        if !request.stderr.trim().is_empty() {
            user_prompt.push_str(&format!(
                "\nTraceback:\n{}\n",
                tail_chars(&request.stderr, REPAIR_STDERR_CHARS)
            ));
        }
        if !request.history.is_empty() {
            user_prompt.push_str("\nEarlier attempts failed with:\n");
            for record in &request.history {
                user_prompt.push_str(&format!(
                    "- attempt {} ({}): {}\n",
                    record.attempt_number, record.error_kind, record.message
                ));
            }
        }
        if let Some(instruction) = request.strategy.approach.instruction() {
            user_prompt.push_str(&format!("\n{}\n", instruction));
        }
        user_prompt.push_str(&format!(
            "\nAnalyze the error and provide:\n\
            1. Root cause\n\
            2. Fixed code\n\
            3. Explanation of the fix\n\n\
            Respond in this format:\n\
            CAUSE: <explanation>\n\
            FIX:\n\
            ```{language}\n\
            <complete fixed code>\n\
            ```\n\
            EXPLANATION: <how it fixes the issue>"
        ));

        let base = self.llm.sampling();
        let sampling = match request.strategy.approach {
            RetryApproach::AlternativeSolution => base.clone(),
            _ => base.with_temperature(base.temperature.min(0.4)),
        };

        self.llm
            .complete_with(&[system_prompt, Message::user(user_prompt)], &sampling)
            .await
            .map_err(|e| EngineError::Generation(format!("Inference failed during repair: {}", e)))
    }
}

/// Pull the artifact out of a completion
///
/// The last non-empty fenced block wins, whatever its language tag. An
/// unterminated fence runs to the end of the text. Without fences the whole
/// trimmed text is the artifact. Code longer than `max_len` characters is
/// rejected rather than cut, since a truncated program cannot run.
pub fn extract_code(text: &str, max_len: usize) -> Result<String, EngineError> {
    let blocks = fenced_blocks(text);
    let code = if blocks.is_empty() {
        text.trim().to_string()
    } else {
        blocks.into_iter().rev().find(|b| !b.is_empty()).unwrap_or_default()
    };

    if code.trim().is_empty() {
        return Err(EngineError::Generation(
            "Model returned no code".to_string(),
        ));
    }

    let length = code.chars().count();
    if length > max_len {
        tracing::warn!("Generated code exceeds max length ({} > {})", length, max_len);
        return Err(EngineError::Generation(format!(
            "Generated code is {} characters, limit is {}",
            length, max_len
        )));
    }
    Ok(code)
}

/// Trimmed contents of every fenced block, in order
pub(crate) fn fenced_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some(lines) => blocks.push(lines.join("\n").trim().to_string()),
                None => current = Some(Vec::new()),
            }
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some(lines) = current {
        blocks.push(lines.join("\n").trim().to_string());
    }

    blocks
}

/// Import lines of a Python artifact
pub fn extract_imports(code: &str) -> Vec<String> {
    code.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("import ") || line.starts_with("from "))
        .map(str::to_string)
        .collect()
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((offset, _)) => &text[offset..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_last_fenced_block() {
        let text = "First try:\n```python\nprint(1)\n```\nBetter:\n```py\nprint(2)\n```\nDone";
        assert_eq!(extract_code(text, 100).unwrap(), "print(2)");
    }

    #[test]
    fn test_extract_without_fences() {
        assert_eq!(
            extract_code("  print('hi')\n\n", 100).unwrap(),
            "print('hi')"
        );
    }

    #[test]
    fn test_extract_unterminated_fence() {
        let text = "```sh\necho one\necho two";
        assert_eq!(extract_code(text, 100).unwrap(), "echo one\necho two");
    }

    #[test]
    fn test_extract_rejects_oversized_code() {
        match extract_code("héllo wörld", 4) {
            Err(EngineError::Generation(msg)) => assert!(msg.contains("11 characters")),
            other => panic!("Expected generation error, got: {:?}", other),
        }
        // Limit counts characters, not bytes
        assert_eq!(extract_code("héllo", 5).unwrap(), "héllo");
    }

    #[test]
    fn test_extract_empty_is_generation_error() {
        assert!(matches!(
            extract_code("```python\n\n```", 100),
            Err(EngineError::Generation(_))
        ));
        assert!(matches!(extract_code("   ", 100), Err(EngineError::Generation(_))));
    }

    #[test]
    fn test_extract_imports() {
        let code = "import os\nfrom math import sqrt\n\ndef f():\n    import json\n    return 1\n";
        assert_eq!(
            extract_imports(code),
            vec!["import os", "from math import sqrt", "import json"]
        );
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("ääää", 2), "ää");
    }
}
