//! Configuration management
//!
//! This module handles loading, validation, and management of the forge configuration.
//! Configuration is stored in TOML format at ~/.forge/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory, project workspace
//! - **llm**: Inference backends and sampling parameters
//! - **execution**: Interpreter, sandbox directory, deadlines and output caps
//! - **agents**: Planner, coder and reflex budgets
//! - **safety**: Restricted operations and the file operation quota
//! - **memory**: Retrieval window and embedding model
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Creates the data, workspace and sandbox directories if they don't exist
//!
//! # Examples
//!
//! ```no_run
//! use forge_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Default provider: {}", config.llm.default_provider);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Inference configuration
    #[serde(default)]
    pub llm: LLMConfig,

    /// Executor settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Per-agent budgets
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Static safety policy
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Memory store configuration
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path, holds forge.db (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root of the per-task project directories (supports ~ expansion)
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Lines of progress log kept per running task for `status`
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Finished tasks whose status stays on the in-memory board
    #[serde(default = "default_finished_tasks_kept")]
    pub finished_tasks_kept: usize,
}

/// Inference configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Preferred provider (ollama, openai); the other one is the fallback
    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// Deadline of one completion request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Width of the shared inference queue
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Whether the provider takes part in routing
    #[serde(default)]
    pub enabled: bool,

    /// Base URL for the API, including the version prefix
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key; local servers need none
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock deadline of one run
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Transport retries of one inference call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Program the artifact is handed to
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Extension of the artifact file
    #[serde(default = "default_artifact_extension")]
    pub artifact_extension: String,

    /// Where artifacts are written and run (supports ~ expansion)
    #[serde(default = "default_sandbox_dir")]
    pub sandbox_dir: PathBuf,

    /// Lines kept per output stream
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,

    /// Bytes kept per output stream
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Command run on the artifact file before execution, empty to skip
    #[serde(default = "default_syntax_check")]
    pub syntax_check: Vec<String>,

    /// Time allowed for output readers after a kill
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
}

/// Agent budgets
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub coder: CoderConfig,

    #[serde(default)]
    pub reflex: ReflexConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Upper bound on planned steps per task
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Experiences retrieved for the planning prompt
    #[serde(default = "default_similar_experiences")]
    pub similar_experiences: usize,

    /// Cosine distance at or below which an experience is shown
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoderConfig {
    /// Generated artifacts are cut to this many characters
    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,

    /// Language named in generation prompts
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflexConfig {
    /// Failed attempts allowed per step
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
}

/// Static safety policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Isolate the child process (cleared environment, own process group)
    #[serde(default = "default_true")]
    pub sandbox_enabled: bool,

    /// Disallowed modules and calls
    #[serde(default = "default_restricted_imports")]
    pub restricted_imports: Vec<String>,

    /// File operations allowed per artifact
    #[serde(default = "default_max_file_operations")]
    pub max_file_operations: usize,
}

/// Memory store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Newest experiences scanned per retrieval
    #[serde(default = "default_max_history_items")]
    pub max_history_items: usize,

    /// "hashing", "ollama:<model>" or "none"
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Vector width of the hashing embedder
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.forge")
}

fn default_workspace() -> PathBuf {
    PathBuf::from("~/.forge/workspace")
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_finished_tasks_kept() -> usize {
    256
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> u32 {
    40
}

fn default_repetition_penalty() -> f32 {
    1.15
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_concurrent_requests() -> usize {
    1
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_openai_base_url() -> String {
    "http://localhost:5000/v1".to_string()
}

fn default_openai_model() -> String {
    "local-model".to_string()
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_artifact_extension() -> String {
    "py".to_string()
}

fn default_sandbox_dir() -> PathBuf {
    PathBuf::from("~/.forge/sandbox")
}

fn default_max_output_lines() -> usize {
    1000
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_syntax_check() -> Vec<String> {
    ["python3", "-m", "py_compile"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_teardown_grace_ms() -> u64 {
    500
}

fn default_max_steps() -> usize {
    20
}

fn default_similar_experiences() -> usize {
    3
}

fn default_similarity_threshold() -> f32 {
    0.6
}

fn default_max_code_length() -> usize {
    8000
}

fn default_language() -> String {
    "python".to_string()
}

fn default_max_fix_attempts() -> u32 {
    3
}

fn default_restricted_imports() -> Vec<String> {
    ["os.system", "subprocess", "eval", "exec", "__import__"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_file_operations() -> usize {
    10
}

fn default_max_history_items() -> usize {
    1000
}

fn default_embedding_model() -> String {
    "hashing".to_string()
}

fn default_embedding_dimensions() -> usize {
    256
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            workspace: default_workspace(),
            log_tail_lines: default_log_tail_lines(),
            finished_tasks_kept: default_finished_tasks_kept(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
            ollama: OllamaConfig::default(),
            openai: OpenAIConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_key_env(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            interpreter: default_interpreter(),
            artifact_extension: default_artifact_extension(),
            sandbox_dir: default_sandbox_dir(),
            max_output_lines: default_max_output_lines(),
            max_output_bytes: default_max_output_bytes(),
            syntax_check: default_syntax_check(),
            teardown_grace_ms: default_teardown_grace_ms(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            similar_experiences: default_similar_experiences(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self {
            max_code_length: default_max_code_length(),
            language: default_language(),
        }
    }
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: default_max_fix_attempts(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sandbox_enabled: true,
            restricted_imports: default_restricted_imports(),
            max_file_operations: default_max_file_operations(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history_items: default_max_history_items(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.forge/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse, validate and process a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // The file keeps the unexpanded `~` paths
        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.forge/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".forge").join("config.toml"))
    }

    /// Path of the SQLite database
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join("forge.db")
    }

    /// Validate field ranges without touching the filesystem
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["ollama", "openai"];
        if !valid_providers.contains(&self.llm.default_provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.llm.default_provider,
                valid_providers.join(", ")
            )));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(EngineError::Config(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if !(self.llm.top_p > 0.0 && self.llm.top_p <= 1.0) {
            return Err(EngineError::Config(
                "top_p must be in (0.0, 1.0]".to_string(),
            ));
        }
        if self.llm.max_concurrent_requests == 0 {
            return Err(EngineError::Config(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }

        if self.execution.timeout_secs == 0 {
            return Err(EngineError::Config(
                "execution.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.execution.max_output_bytes == 0 {
            return Err(EngineError::Config(
                "execution.max_output_bytes must be greater than 0".to_string(),
            ));
        }
        if self.execution.interpreter.trim().is_empty() {
            return Err(EngineError::Config(
                "execution.interpreter must not be empty".to_string(),
            ));
        }

        if self.agents.planner.max_steps == 0 {
            return Err(EngineError::Config(
                "agents.planner.max_steps must be greater than 0".to_string(),
            ));
        }
        // Also rejects NaN
        if !(self.agents.planner.similarity_threshold >= 0.0) {
            return Err(EngineError::Config(
                "agents.planner.similarity_threshold must be a non-negative number".to_string(),
            ));
        }
        if self.agents.reflex.max_fix_attempts == 0 {
            return Err(EngineError::Config(
                "agents.reflex.max_fix_attempts must be greater than 0".to_string(),
            ));
        }

        let model = self.memory.embedding_model.as_str();
        let known_model = model == "hashing"
            || model == "none"
            || model
                .strip_prefix("ollama:")
                .is_some_and(|name| !name.is_empty());
        if !known_model {
            return Err(EngineError::Config(format!(
                "Invalid embedding model '{}'. Use hashing, ollama:<model> or none",
                model
            )));
        }
        if self.memory.embedding_dimensions == 0 {
            return Err(EngineError::Config(
                "memory.embedding_dimensions must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates field ranges
    /// - Expands ~ in paths
    /// - Creates the data, workspace and sandbox directories
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        self.validate()?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.core.workspace = expand_path(&self.core.workspace)?;
        self.execution.sandbox_dir = expand_path(&self.execution.sandbox_dir)?;

        for dir in [
            &self.core.data_dir,
            &self.core.workspace,
            &self.execution.sandbox_dir,
        ] {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    EngineError::Config(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
            }
            if !dir.is_dir() {
                return Err(EngineError::Config(format!(
                    "Path is not a directory: {:?}",
                    dir
                )));
            }
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.llm.default_provider, "ollama");
        assert_eq!(config.llm.max_tokens, 4096);
        assert_eq!(config.execution.timeout_secs, 60);
        assert_eq!(config.agents.planner.max_steps, 20);
        assert_eq!(config.agents.reflex.max_fix_attempts, 3);
        assert_eq!(config.core.finished_tasks_kept, 256);
        assert_eq!(config.execution.max_output_bytes, 1024 * 1024);
        assert_eq!(
            config.execution.syntax_check,
            vec!["python3", "-m", "py_compile"]
        );
        assert!(config.safety.sandbox_enabled);
        assert!(config
            .safety
            .restricted_imports
            .contains(&"os.system".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [agents.reflex]
            max_fix_attempts = 5

            [safety]
            restricted_imports = ["socket"]
            "#,
        )
        .unwrap();

        assert_eq!(config.agents.reflex.max_fix_attempts, 5);
        assert_eq!(config.agents.planner.max_steps, 20);
        assert_eq!(config.safety.restricted_imports, vec!["socket"]);
        assert_eq!(config.safety.max_file_operations, 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.llm.temperature = 2.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agents.reflex.max_fix_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agents.planner.similarity_threshold = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.execution.max_output_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.memory.embedding_model = "ollama:".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.memory.embedding_model = "ollama:nomic-embed-text".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(
            config.safety.restricted_imports,
            deserialized.safety.restricted_imports
        );
    }
}
