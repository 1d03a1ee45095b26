//! Shared fixtures for the integration tests
//!
//! Scenarios run real `/bin/sh` artifacts against a scripted inference
//! backend, so they need neither Python nor a model server.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use forge_engine::config::Config;
use forge_engine::db::Database;
use forge_engine::llm::{InferencePort, LLMError, LLMProvider, Message, SamplingParams};
use forge_engine::memory::{embedder_from_config, MemoryStore};

/// Replays canned completions in order and records every prompt
pub struct ScriptedLlm {
    script: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            script: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }

    /// User message of the n-th call
    pub fn user_prompt(&self, call: usize) -> String {
        self.prompts.lock().unwrap()[call]
            .iter()
            .filter(|m| m.role == forge_engine::llm::MessageRole::User)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl LLMProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[Message],
        _sampling: &SamplingParams,
    ) -> forge_engine::llm::Result<String> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LLMError::InvalidRequest("script exhausted".to_string()))
    }
}

/// Config rooted in a temp dir that runs artifacts with `sh`
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.core.data_dir = dir.path().join("data");
    config.core.workspace = dir.path().join("workspace");
    config.execution.sandbox_dir = dir.path().join("sandbox");
    config.execution.interpreter = "sh".to_string();
    config.execution.artifact_extension = "sh".to_string();
    config.execution.timeout_secs = 5;
    config.execution.teardown_grace_ms = 200;
    config.execution.syntax_check = vec!["sh".to_string(), "-n".to_string()];
    config.agents.coder.language = "sh".to_string();
    config.agents.reflex.max_fix_attempts = 3;
    config.memory.embedding_model = "hashing".to_string();
    config
}

pub async fn open_memory(config: &Config) -> Arc<MemoryStore> {
    let db = Database::new(&config.db_path()).await.unwrap();
    let embedder = embedder_from_config(config).unwrap();
    Arc::new(MemoryStore::new(
        db,
        embedder,
        config.memory.max_history_items,
    ))
}

pub fn port_over(llm: &Arc<ScriptedLlm>) -> Arc<InferencePort> {
    let provider: Arc<dyn LLMProvider> = llm.clone();
    Arc::new(
        InferencePort::new(
            vec![provider],
            SamplingParams::default(),
            2,
            Duration::from_secs(5),
            0,
        )
        .with_retry_delay(Duration::from_millis(1)),
    )
}

/// A fenced shell artifact, the way a model would answer
pub fn sh(code: &str) -> String {
    format!("Here is the script:\n```sh\n{}\n```\n", code)
}

/// A repair answer in the CAUSE / FIX / EXPLANATION layout
pub fn repair(cause: &str, code: &str) -> String {
    format!(
        "CAUSE: {}\nFIX:\n```sh\n{}\n```\nEXPLANATION: The script now runs.",
        cause, code
    )
}

/// One-step JSON plan
pub fn single_step_plan(description: &str) -> String {
    serde_json::json!([
        {"id": "step_1", "description": description, "dependencies": []}
    ])
    .to_string()
}
