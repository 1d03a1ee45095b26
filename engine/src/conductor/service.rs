//! Caller-facing service
//!
//! `submit_task`, `get_status` and `get_result` are the only ways a host
//! observes the engine. Each submitted task runs on its own tokio task; tasks
//! never share in-flight state beyond the store and the status board.

use anyhow::Context;
use futures::FutureExt;
use sdk::errors::EngineError;
use sdk::types::{TaskReport, TaskStatus, TaskStatusView};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

use crate::conductor::orchestrator::{load_report, Orchestrator};
use crate::conductor::status::StatusBoard;
use crate::config::Config;
use crate::db::Database;
use crate::llm::InferencePort;
use crate::memory::{embedder_from_config, MemoryStore};

pub struct AgentService {
    orchestrator: Arc<Orchestrator>,
    memory: Arc<MemoryStore>,
    llm: Arc<InferencePort>,
    board: Arc<StatusBoard>,
}

impl AgentService {
    /// Open the store and wire every component from config
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, no inference
    /// provider is configured or the safety policy does not compile.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let db = Database::new(&config.db_path())
            .await
            .context("Failed to open database")?;
        let embedder = embedder_from_config(config)?;
        let memory = Arc::new(MemoryStore::new(
            db,
            embedder,
            config.memory.max_history_items,
        ));
        let llm = Arc::new(
            InferencePort::from_config(config).context("Failed to set up inference providers")?,
        );
        Self::with_parts(config, llm, memory)
    }

    /// Wire the service around an existing store and inference port
    pub fn with_parts(
        config: &Config,
        llm: Arc<InferencePort>,
        memory: Arc<MemoryStore>,
    ) -> anyhow::Result<Self> {
        let board = Arc::new(StatusBoard::new(
            config.core.log_tail_lines,
            config.core.finished_tasks_kept,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            Arc::clone(&llm),
            Arc::clone(&memory),
            Arc::clone(&board),
        )?);

        Ok(Self {
            orchestrator,
            memory,
            llm,
            board,
        })
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn llm(&self) -> &Arc<InferencePort> {
        &self.llm
    }

    /// Persist a task and start it in the background
    ///
    /// Returns as soon as the task is stored; progress is visible through
    /// `get_status`.
    pub async fn submit_task(&self, description: &str) -> Result<String, EngineError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        if !self.board.register(&task_id, TaskStatus::Pending) {
            return Err(EngineError::TaskAlreadyRunning(task_id));
        }

        let task = match self.memory.create_task(&task_id, description).await {
            Ok(task) => task,
            Err(e) => {
                self.board.finish(&task_id, TaskStatus::Aborted);
                return Err(e);
            }
        };
        self.board.log(&task_id, "Task submitted");
        info!("Submitted task {}", task_id);

        let orchestrator = Arc::clone(&self.orchestrator);
        let memory = Arc::clone(&self.memory);
        let board = Arc::clone(&self.board);
        let id = task_id.clone();
        tokio::spawn(async move {
            // Only effective where panics unwind; release builds abort instead
            let outcome = AssertUnwindSafe(orchestrator.run(task))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!("Orchestrator panicked while running task {}", id);
                if let Err(e) = memory
                    .finish_task(&id, TaskStatus::Aborted, Some("Internal error"))
                    .await
                {
                    error!("Failed to record abort of task {}: {}", id, e);
                }
                board.finish(&id, TaskStatus::Aborted);
            }
        });

        Ok(task_id)
    }

    /// Current status, step in progress and log tail
    ///
    /// Tasks not run by this process are answered from the store with an
    /// empty log tail.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatusView, EngineError> {
        if let Some(view) = self.board.view(task_id) {
            return Ok(view);
        }

        let task = self
            .memory
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        Ok(TaskStatusView {
            task_id: task.id,
            status: task.status,
            current_step: None,
            log_tail: Vec::new(),
        })
    }

    /// Full structured record of a task, rebuilt from the store
    pub async fn get_result(&self, task_id: &str) -> Result<TaskReport, EngineError> {
        load_report(&self.memory, task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// Wait until a task reaches a terminal status, then return its record
    pub async fn wait(&self, task_id: &str) -> Result<TaskReport, EngineError> {
        if let Some(mut done) = self.board.subscribe(task_id) {
            // Eviction drops the sender only after `finish`, so a closed channel also means done
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_result(task_id).await
    }

    /// Submit a task and wait for it
    pub async fn run_task(&self, description: &str) -> Result<TaskReport, EngineError> {
        let task_id = self.submit_task(description).await?;
        self.wait(&task_id).await
    }

    /// Flush the write-ahead log before exit
    pub async fn shutdown(&self) {
        if let Err(e) = self.memory.database().flush_wal().await {
            error!("Failed to flush database: {:#}", e);
        }
    }
}
