//! Forge Engine Library
//!
//! This library provides the core functionality of the forge agent.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// LLM provider abstraction layer
pub mod llm;

/// Memory store: history, version log and experience retrieval
pub mod memory;

/// Static safety policy for generated code
pub mod safety_policy;

/// Conductor orchestration module
pub mod conductor;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
