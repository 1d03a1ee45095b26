/// Task and step persistence operations
///
/// All queries are parameterized. Status columns hold the snake_case labels
/// from `sdk::types`, so rows parse back through `FromStr`.
use anyhow::{anyhow, Context, Result};
use sdk::types::{Complexity, ErrorKind, Step, StepStatus, Task, TaskStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::unix_now;

/// Task repository for database operations
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    /// Create a new task repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new task in `Pending`
    pub async fn create_task(&self, id: &str, description: &str) -> Result<Task> {
        let now = unix_now()?;

        sqlx::query("INSERT INTO tasks (id, description, status, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(description)
            .bind(TaskStatus::Pending.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to create task")?;

        Ok(Task {
            id: id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            task_type: None,
            created_at: now,
            completed_at: None,
            error: None,
        })
    }

    /// Update task status
    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("Failed to update task status")?;

        Ok(())
    }

    /// Record the planner's classification of a task
    pub async fn set_task_profile(
        &self,
        task_id: &str,
        task_type: &str,
        complexity: Option<Complexity>,
    ) -> Result<()> {
        let complexity = complexity.map(|c| c.as_str());

        sqlx::query("UPDATE tasks SET task_type = ?, complexity = ? WHERE id = ?")
            .bind(task_type)
            .bind(complexity)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("Failed to update task profile")?;

        Ok(())
    }

    /// Move a task into a terminal status
    pub async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = unix_now()?;

        sqlx::query("UPDATE tasks SET status = ?, completed_at = ?, error = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("Failed to finish task")?;

        Ok(())
    }

    /// Get a task by ID
    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, description, status, task_type, created_at, completed_at, error
             FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get task")?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Get the stored complexity label of a task
    pub async fn get_task_complexity(&self, task_id: &str) -> Result<Option<Complexity>> {
        let label: Option<Option<String>> =
            sqlx::query_scalar("SELECT complexity FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to get task complexity")?;

        Ok(match label.flatten().as_deref() {
            Some("simple") => Some(Complexity::Simple),
            Some("moderate") => Some(Complexity::Moderate),
            Some("complex") => Some(Complexity::Complex),
            _ => None,
        })
    }

    /// Get recent tasks, newest first
    pub async fn get_recent_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT id, description, status, task_type, created_at, completed_at, error
             FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get recent tasks")?;

        rows.iter().map(task_from_row).collect()
    }

    /// Get all tasks currently in a status
    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT id, description, status, task_type, created_at, completed_at, error
             FROM tasks WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to get tasks by status")?;

        rows.iter().map(task_from_row).collect()
    }

    /// Insert a whole plan in one transaction
    pub async fn insert_steps(&self, steps: &[Step]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for step in steps {
            let dependencies = serde_json::to_string(&step.dependencies)?;
            sqlx::query(
                "INSERT INTO steps (id, task_id, sequence_index, step_key, description,
                                    dependencies, status, fix_attempts_used)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id)
            .bind(&step.task_id)
            .bind(step.sequence_index as i64)
            .bind(&step.key)
            .bind(&step.description)
            .bind(dependencies)
            .bind(step.status.as_str())
            .bind(step.fix_attempts_used as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to insert step")?;
        }

        tx.commit().await.context("Failed to commit plan")?;
        Ok(())
    }

    /// Persist the mutable fields of a step
    pub async fn update_step(&self, step: &Step) -> Result<()> {
        sqlx::query(
            "UPDATE steps SET status = ?, artifact = ?, fix_attempts_used = ?,
                              error_kind = ?, error = ?
             WHERE id = ?",
        )
        .bind(step.status.as_str())
        .bind(&step.artifact)
        .bind(step.fix_attempts_used as i64)
        .bind(step.error_kind.map(|k| k.as_str()))
        .bind(&step.error)
        .bind(&step.id)
        .execute(&self.pool)
        .await
        .context("Failed to update step")?;

        Ok(())
    }

    /// Get all steps for a task in sequence order
    pub async fn get_task_steps(&self, task_id: &str) -> Result<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, task_id, sequence_index, step_key, description, dependencies, status,
                    artifact, fix_attempts_used, error_kind, error
             FROM steps WHERE task_id = ? ORDER BY sequence_index ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get task steps")?;

        rows.iter().map(step_from_row).collect()
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    Ok(Task {
        id: row.get("id"),
        description: row.get("description"),
        status: status.parse::<TaskStatus>().map_err(|e| anyhow!(e))?,
        task_type: row.get("task_type"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        error: row.get("error"),
    })
}

fn step_from_row(row: &SqliteRow) -> Result<Step> {
    let status: String = row.get("status");
    let status = status.parse::<StepStatus>().map_err(|e| anyhow!(e))?;
    let dependencies: String = row.get("dependencies");
    let error_kind: Option<String> = row.get("error_kind");
    let error_kind = error_kind
        .map(|k| k.parse::<ErrorKind>())
        .transpose()
        .map_err(|e| anyhow!(e))?;

    Ok(Step {
        id: row.get("id"),
        task_id: row.get("task_id"),
        sequence_index: row.get::<i64, _>("sequence_index") as u32,
        key: row.get("step_key"),
        description: row.get("description"),
        dependencies: serde_json::from_str(&dependencies)
            .context("Corrupt dependency list in steps table")?,
        status,
        artifact: row.get("artifact"),
        fix_attempts_used: row.get::<i64, _>("fix_attempts_used") as u32,
        error_kind,
        error: row.get("error"),
    })
}
