//! Memory store
//!
//! The durable side of every task: status transitions, plans, execution and
//! error logs, the version log and the experience index used for similarity
//! retrieval. Two rules shape this module:
//!
//! - Writes either land or surface as `EngineError::MemoryWrite`, which the
//!   orchestrator treats as fatal to the task.
//! - `retrieve_similar` never fails. With no embedder, or when the embedder
//!   or the index errors, it returns an empty list.
//!
//! Writers to one task id are serialized through a per-task async lock.
//! Different task ids write concurrently.

pub mod embedding;

use sdk::errors::EngineError;
use sdk::types::{
    Complexity, ErrorKind, ErrorRecord, ExecutionResult, Experience, Step, StepStatus, Task,
    TaskStatus, VersionEntry,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use crate::db::{Database, ErrorSummary, NewExperience};
pub use embedding::{cosine_distance, embedder_from_config, Embedder, HashingEmbedder};

type TaskLock = tokio::sync::Mutex<()>;

/// A terminal outcome to remember
#[derive(Debug, Clone)]
pub enum OutcomeRecord {
    /// Final status of a whole task
    Task {
        task_id: String,
        task_type: String,
        description: String,
        status: TaskStatus,
    },
    /// Final status of one step
    Step {
        task_id: String,
        step_id: String,
        task_type: String,
        description: String,
        status: StepStatus,
        detail: Option<String>,
    },
    /// A failure that a later attempt repaired
    Fix {
        task_id: String,
        step_id: String,
        task_type: String,
        error_kind: ErrorKind,
        fix_description: String,
    },
}

impl OutcomeRecord {
    fn into_parts(self) -> (String, Option<String>, String, String, String) {
        match self {
            OutcomeRecord::Task {
                task_id,
                task_type,
                description,
                status,
            } => (task_id, None, task_type, description, status.as_str().to_string()),
            OutcomeRecord::Step {
                task_id,
                step_id,
                task_type,
                description,
                status,
                detail,
            } => {
                let pattern = match detail {
                    Some(detail) if !detail.is_empty() => format!("{}\n{}", description, detail),
                    _ => description,
                };
                (task_id, Some(step_id), task_type, pattern, status.as_str().to_string())
            }
            OutcomeRecord::Fix {
                task_id,
                step_id,
                task_type,
                error_kind,
                fix_description,
            } => (
                task_id,
                Some(step_id),
                task_type,
                format!("{}: {}", error_kind, fix_description),
                "fixed".to_string(),
            ),
        }
    }
}

fn write_err(e: anyhow::Error) -> EngineError {
    EngineError::MemoryWrite(format!("{:#}", e))
}

fn read_err(e: anyhow::Error) -> EngineError {
    EngineError::MemoryRead(format!("{:#}", e))
}

/// Shared memory store
pub struct MemoryStore {
    db: Database,
    embedder: Option<Arc<dyn Embedder>>,
    max_history_items: usize,
    locks: Mutex<HashMap<String, Weak<TaskLock>>>,
}

impl MemoryStore {
    pub fn new(db: Database, embedder: Option<Arc<dyn Embedder>>, max_history_items: usize) -> Self {
        Self {
            db,
            embedder,
            max_history_items,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Model id of the embedder, `None` in degraded mode
    pub fn embedding_model(&self) -> Option<&str> {
        self.embedder.as_ref().map(|e| e.model_id())
    }

    /// Lock serializing writers of one task
    ///
    /// Entries are weak, so a task's lock disappears once no writer holds it.
    fn task_lock(&self, task_id: &str) -> Arc<TaskLock> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(task_id).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(TaskLock::new(()));
        locks.insert(task_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    // ---- durable writes ----

    pub async fn create_task(&self, task_id: &str, description: &str) -> Result<Task, EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.db
            .tasks()
            .create_task(task_id, description)
            .await
            .map_err(write_err)
    }

    pub async fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.db
            .tasks()
            .update_task_status(task_id, status)
            .await
            .map_err(write_err)
    }

    pub async fn set_task_profile(
        &self,
        task_id: &str,
        task_type: &str,
        complexity: Option<Complexity>,
    ) -> Result<(), EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.db
            .tasks()
            .set_task_profile(task_id, task_type, complexity)
            .await
            .map_err(write_err)
    }

    pub async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.db
            .tasks()
            .finish_task(task_id, status, error)
            .await
            .map_err(write_err)
    }

    pub async fn insert_steps(&self, task_id: &str, steps: &[Step]) -> Result<(), EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.db.tasks().insert_steps(steps).await.map_err(write_err)
    }

    pub async fn update_step(&self, step: &Step) -> Result<(), EngineError> {
        let lock = self.task_lock(&step.task_id);
        let _guard = lock.lock().await;
        self.db.tasks().update_step(step).await.map_err(write_err)
    }

    pub async fn record_execution(
        &self,
        task_id: &str,
        result: &ExecutionResult,
    ) -> Result<(), EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.db
            .history()
            .record_execution(result)
            .await
            .map_err(write_err)
    }

    pub async fn record_error(&self, record: &ErrorRecord) -> Result<(), EngineError> {
        let lock = self.task_lock(&record.task_id);
        let _guard = lock.lock().await;
        self.db.history().record_error(record).await.map_err(write_err)
    }

    /// Mark the earlier failures of a step as repaired
    pub async fn mark_error_fixed(&self, task_id: &str, step_id: &str) -> Result<u64, EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.db
            .history()
            .mark_errors_fixed(step_id)
            .await
            .map_err(write_err)
    }

    /// Append an accepted artifact to the version log
    pub async fn commit_version(
        &self,
        step: &Step,
        artifact: &str,
    ) -> Result<VersionEntry, EngineError> {
        let lock = self.task_lock(&step.task_id);
        let _guard = lock.lock().await;
        self.db
            .versions()
            .commit(&step.task_id, step, artifact)
            .await
            .map_err(write_err)
    }

    /// Write an experience row
    ///
    /// The row is the durable part. If the embedder fails the row is stored
    /// without a vector and simply never shows up in retrieval.
    pub async fn record_outcome(&self, record: OutcomeRecord) -> Result<i64, EngineError> {
        let (task_id, step_id, task_type, pattern, outcome) = record.into_parts();

        let embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(&pattern).await {
                Ok(vector) => Some((vector, embedder.model_id().to_string())),
                Err(e) => {
                    warn!("Embedding failed, storing experience without vector: {:#}", e);
                    None
                }
            },
            None => None,
        };

        let lock = self.task_lock(&task_id);
        let _guard = lock.lock().await;
        let id = self
            .db
            .experiences()
            .insert(&NewExperience {
                task_id: task_id.clone(),
                step_id,
                task_type,
                pattern,
                outcome,
                embedding,
            })
            .await
            .map_err(write_err)?;

        debug!("Recorded experience {} for task {}", id, task_id);
        Ok(id)
    }

    // ---- reads ----

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, EngineError> {
        self.db.tasks().get_task(task_id).await.map_err(read_err)
    }

    pub async fn get_task_complexity(&self, task_id: &str) -> Result<Option<Complexity>, EngineError> {
        self.db
            .tasks()
            .get_task_complexity(task_id)
            .await
            .map_err(read_err)
    }

    pub async fn get_steps(&self, task_id: &str) -> Result<Vec<Step>, EngineError> {
        self.db.tasks().get_task_steps(task_id).await.map_err(read_err)
    }

    pub async fn get_execution_results(
        &self,
        step_id: &str,
    ) -> Result<Vec<ExecutionResult>, EngineError> {
        self.db
            .history()
            .get_execution_results(step_id)
            .await
            .map_err(read_err)
    }

    pub async fn get_errors(&self, task_id: &str) -> Result<Vec<ErrorRecord>, EngineError> {
        self.db
            .history()
            .get_task_errors(task_id)
            .await
            .map_err(read_err)
    }

    pub async fn get_step_errors(&self, step_id: &str) -> Result<Vec<ErrorRecord>, EngineError> {
        self.db
            .history()
            .get_step_errors(step_id)
            .await
            .map_err(read_err)
    }

    pub async fn recent_tasks(&self, limit: i64) -> Result<Vec<Task>, EngineError> {
        self.db
            .tasks()
            .get_recent_tasks(limit)
            .await
            .map_err(read_err)
    }

    pub async fn common_errors(&self, limit: i64) -> Result<Vec<ErrorSummary>, EngineError> {
        self.db.history().common_errors(limit).await.map_err(read_err)
    }

    pub async fn errors_by_kind(
        &self,
        kind: ErrorKind,
        limit: i64,
    ) -> Result<Vec<ErrorRecord>, EngineError> {
        self.db
            .history()
            .errors_by_kind(kind, limit)
            .await
            .map_err(read_err)
    }

    pub async fn version_history(&self, task_id: &str) -> Result<Vec<VersionEntry>, EngineError> {
        self.db.versions().history(task_id).await.map_err(read_err)
    }

    pub async fn rollback_to(
        &self,
        task_id: &str,
        step_id: &str,
    ) -> Result<Vec<VersionEntry>, EngineError> {
        self.db
            .versions()
            .rollback_to(task_id, step_id)
            .await
            .map_err(read_err)
    }

    /// Up to `k` experiences closest to `text`
    ///
    /// Ordered by ascending cosine distance, ties going to the most recent
    /// record. Only the newest `max_history_items` rows with a vector from
    /// the current model are considered.
    pub async fn retrieve_similar(&self, text: &str, k: usize) -> Vec<Experience> {
        let Some(embedder) = &self.embedder else {
            debug!("No embedder configured, similarity retrieval disabled");
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let query = match embedder.embed(text).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Embedding unavailable, skipping retrieval: {:#}", e);
                return Vec::new();
            }
        };

        let candidates = match self
            .db
            .experiences()
            .recent_with_embedding(embedder.model_id(), self.max_history_items as i64)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Experience index unreadable, skipping retrieval: {:#}", e);
                return Vec::new();
            }
        };

        rank_by_distance(&query, candidates, k)
    }
}

/// Sort candidates by (distance asc, created_at desc, id desc) and keep `k`
pub fn rank_by_distance(query: &[f32], candidates: Vec<Experience>, k: usize) -> Vec<Experience> {
    let mut scored: Vec<Experience> = candidates
        .into_iter()
        .filter(|e| e.embedding.len() == query.len())
        .map(|mut e| {
            e.distance = Some(cosine_distance(query, &e.embedding));
            e
        })
        .collect();

    scored.sort_by(|a, b| {
        let da = a.distance.unwrap_or(f32::MAX);
        let db = b.distance.unwrap_or(f32::MAX);
        da.total_cmp(&db)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.id.cmp(&a.id))
    });
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn experience(id: i64, created_at: i64, embedding: Vec<f32>) -> Experience {
        Experience {
            id,
            task_id: "t".to_string(),
            step_id: None,
            task_type: "general".to_string(),
            pattern: format!("p{}", id),
            outcome: "completed".to_string(),
            embedding,
            distance: None,
            created_at,
        }
    }

    #[test]
    fn test_rank_breaks_ties_by_recency() {
        let query = vec![1.0, 0.0];
        let ranked = rank_by_distance(
            &query,
            vec![
                experience(1, 100, vec![1.0, 0.0]),
                experience(2, 200, vec![1.0, 0.0]),
                experience(3, 200, vec![0.0, 1.0]),
                experience(4, 200, vec![1.0, 0.0]),
                experience(5, 300, vec![1.0]),
            ],
            3,
        );
        let ids: Vec<_> = ranked.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 2, 1]);
        assert!(ranked[0].distance.unwrap().abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_task_locks_are_shared_and_released() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("m.db")).await.unwrap();
        let store = MemoryStore::new(db, None, 10);

        let a = store.task_lock("t1");
        let b = store.task_lock("t1");
        assert!(Arc::ptr_eq(&a, &b));
        let other = store.task_lock("t2");
        assert!(!Arc::ptr_eq(&a, &other));

        drop(a);
        drop(b);
        drop(other);
        let _fresh = store.task_lock("t3");
        assert_eq!(store.locks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_mode_returns_empty() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("m.db")).await.unwrap();
        let store = MemoryStore::new(db, None, 10);

        store.create_task("t1", "sum numbers").await.unwrap();
        store
            .record_outcome(OutcomeRecord::Task {
                task_id: "t1".to_string(),
                task_type: "general".to_string(),
                description: "sum numbers".to_string(),
                status: TaskStatus::Completed,
            })
            .await
            .unwrap();

        assert!(store.retrieve_similar("sum numbers", 3).await.is_empty());
        assert!(store.embedding_model().is_none());
    }

    #[tokio::test]
    async fn test_write_failure_is_memory_write() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("m.db")).await.unwrap();
        let store = MemoryStore::new(db.clone(), None, 10);
        store.create_task("t1", "x").await.unwrap();

        // Duplicate primary key
        let err = store.create_task("t1", "x").await.unwrap_err();
        assert!(matches!(err, EngineError::MemoryWrite(_)));

        db.pool().close().await;
        let err = store.get_task("t1").await.unwrap_err();
        assert!(matches!(err, EngineError::MemoryRead(_)));
    }
}
