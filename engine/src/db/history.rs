/// Execution results and classified error records
///
/// Both tables only grow: results are immutable once written, and the only
/// update an error record ever sees is the `fixed` flag flipping to true
/// when a later attempt of the same step succeeds.
use anyhow::{anyhow, Context, Result};
use sdk::types::{ErrorKind, ErrorRecord, ExecutionResult, Outcome};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::unix_now;

/// Error kind frequency, as reported by `common_errors`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorSummary {
    pub error_kind: ErrorKind,
    pub count: i64,
    pub fixed_count: i64,
    /// Most recent message of this kind
    pub sample_message: String,
}

/// Repository for the execution log and the error log
#[derive(Clone)]
pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one execution result
    pub async fn record_execution(&self, result: &ExecutionResult) -> Result<()> {
        let now = unix_now()?;

        sqlx::query(
            "INSERT INTO execution_results (step_id, attempt_number, stdout, stderr, exit_code,
                                            exit_signal, duration_ms, outcome, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.step_id)
        .bind(result.attempt_number as i64)
        .bind(&result.stdout)
        .bind(&result.stderr)
        .bind(result.exit_code)
        .bind(result.exit_signal)
        .bind(result.duration_ms as i64)
        .bind(result.outcome.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to record execution result")?;

        Ok(())
    }

    /// Get all execution results of a step, by attempt
    pub async fn get_execution_results(&self, step_id: &str) -> Result<Vec<ExecutionResult>> {
        let rows = sqlx::query(
            "SELECT step_id, attempt_number, stdout, stderr, exit_code, exit_signal,
                    duration_ms, outcome
             FROM execution_results WHERE step_id = ? ORDER BY attempt_number ASC",
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get execution results")?;

        rows.iter().map(execution_from_row).collect()
    }

    /// Count execution results across every step of a task
    pub async fn count_task_executions(&self, task_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM execution_results r
             JOIN steps s ON s.id = r.step_id WHERE s.task_id = ?",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count execution results")?;

        Ok(count)
    }

    /// Append one error record
    pub async fn record_error(&self, record: &ErrorRecord) -> Result<()> {
        let now = unix_now()?;

        sqlx::query(
            "INSERT INTO errors (task_id, step_id, attempt_number, error_kind, message,
                                 derived_fix_description, fixed, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.task_id)
        .bind(&record.step_id)
        .bind(record.attempt_number as i64)
        .bind(record.error_kind.as_str())
        .bind(&record.message)
        .bind(&record.derived_fix_description)
        .bind(record.fixed)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to record error")?;

        Ok(())
    }

    /// Mark every error of a step as fixed
    pub async fn mark_errors_fixed(&self, step_id: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE errors SET fixed = 1 WHERE step_id = ? AND fixed = 0")
            .bind(step_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark errors fixed")?;

        Ok(result.rows_affected())
    }

    /// Get the error records of a step, by attempt
    pub async fn get_step_errors(&self, step_id: &str) -> Result<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, step_id, attempt_number, error_kind, message,
                    derived_fix_description, fixed
             FROM errors WHERE step_id = ? ORDER BY attempt_number ASC, id ASC",
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get step errors")?;

        rows.iter().map(error_from_row).collect()
    }

    /// Get the error records of a task
    pub async fn get_task_errors(&self, task_id: &str) -> Result<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, step_id, attempt_number, error_kind, message,
                    derived_fix_description, fixed
             FROM errors WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get task errors")?;

        rows.iter().map(error_from_row).collect()
    }

    /// Get the most recent error records of one kind
    pub async fn errors_by_kind(&self, kind: ErrorKind, limit: i64) -> Result<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, step_id, attempt_number, error_kind, message,
                    derived_fix_description, fixed
             FROM errors WHERE error_kind = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get errors by kind")?;

        rows.iter().map(error_from_row).collect()
    }

    /// Most frequent error kinds with how often they were fixed
    pub async fn common_errors(&self, limit: i64) -> Result<Vec<ErrorSummary>> {
        let rows = sqlx::query(
            "SELECT e.error_kind AS error_kind,
                    COUNT(*) AS count,
                    SUM(CASE WHEN e.fixed THEN 1 ELSE 0 END) AS fixed_count,
                    (SELECT message FROM errors m WHERE m.error_kind = e.error_kind
                     ORDER BY m.id DESC LIMIT 1) AS sample_message
             FROM errors e
             GROUP BY e.error_kind
             ORDER BY count DESC, e.error_kind ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get common errors")?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("error_kind");
                Ok(ErrorSummary {
                    error_kind: kind.parse().map_err(|e: String| anyhow!(e))?,
                    count: row.get("count"),
                    fixed_count: row.get("fixed_count"),
                    sample_message: row.get("sample_message"),
                })
            })
            .collect()
    }
}

fn execution_from_row(row: &SqliteRow) -> Result<ExecutionResult> {
    let outcome: String = row.get("outcome");
    Ok(ExecutionResult {
        step_id: row.get("step_id"),
        attempt_number: row.get::<i64, _>("attempt_number") as u32,
        stdout: row.get("stdout"),
        stderr: row.get("stderr"),
        exit_code: row.get("exit_code"),
        exit_signal: row.get("exit_signal"),
        duration_ms: row.get::<i64, _>("duration_ms") as u64,
        outcome: outcome.parse::<Outcome>().map_err(|e| anyhow!(e))?,
    })
}

fn error_from_row(row: &SqliteRow) -> Result<ErrorRecord> {
    let kind: String = row.get("error_kind");
    Ok(ErrorRecord {
        task_id: row.get("task_id"),
        step_id: row.get("step_id"),
        attempt_number: row.get::<i64, _>("attempt_number") as u32,
        error_kind: kind.parse::<ErrorKind>().map_err(|e| anyhow!(e))?,
        message: row.get("message"),
        derived_fix_description: row.get("derived_fix_description"),
        fixed: row.get("fixed"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use sdk::types::{Step, StepStatus};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("h.db")).await.unwrap();
        db.tasks().create_task("t1", "task").await.unwrap();
        db.tasks()
            .insert_steps(&[Step {
                id: "s1".to_string(),
                task_id: "t1".to_string(),
                sequence_index: 0,
                key: "step_1".to_string(),
                description: "only step".to_string(),
                dependencies: vec![],
                status: StepStatus::Pending,
                artifact: None,
                fix_attempts_used: 0,
                error_kind: None,
                error: None,
            }])
            .await
            .unwrap();
        (temp_dir, db)
    }

    fn error(attempt: u32, kind: ErrorKind) -> ErrorRecord {
        ErrorRecord {
            step_id: "s1".to_string(),
            task_id: "t1".to_string(),
            attempt_number: attempt,
            error_kind: kind,
            message: format!("failure {}", attempt),
            derived_fix_description: "define the name".to_string(),
            fixed: false,
        }
    }

    #[tokio::test]
    async fn test_execution_results_are_ordered_by_attempt() {
        let (_dir, db) = setup().await;
        let history = db.history();

        for (attempt, outcome) in [(2, Outcome::Success), (1, Outcome::Exception)] {
            history
                .record_execution(&ExecutionResult {
                    step_id: "s1".to_string(),
                    attempt_number: attempt,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: Some(if outcome == Outcome::Success { 0 } else { 1 }),
                    exit_signal: None,
                    duration_ms: 12,
                    outcome,
                })
                .await
                .unwrap();
        }

        let results = history.get_execution_results("s1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].attempt_number, 1);
        assert_eq!(results[0].outcome, Outcome::Exception);
        assert_eq!(results[1].outcome, Outcome::Success);
        assert_eq!(history.count_task_executions("t1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_attempt_is_rejected() {
        let (_dir, db) = setup().await;
        let history = db.history();
        let result = ExecutionResult {
            step_id: "s1".to_string(),
            attempt_number: 1,
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            exit_signal: None,
            duration_ms: 1,
            outcome: Outcome::Success,
        };
        history.record_execution(&result).await.unwrap();
        assert!(history.record_execution(&result).await.is_err());
    }

    #[tokio::test]
    async fn test_errors_fixed_and_grouped() {
        let (_dir, db) = setup().await;
        let history = db.history();

        history
            .record_error(&error(1, ErrorKind::NameReference))
            .await
            .unwrap();
        history
            .record_error(&error(2, ErrorKind::NameReference))
            .await
            .unwrap();
        history
            .record_error(&error(3, ErrorKind::Syntax))
            .await
            .unwrap();

        assert_eq!(history.mark_errors_fixed("s1").await.unwrap(), 3);

        let common = history.common_errors(10).await.unwrap();
        assert_eq!(common[0].error_kind, ErrorKind::NameReference);
        assert_eq!(common[0].count, 2);
        assert_eq!(common[0].fixed_count, 2);
        assert_eq!(common[0].sample_message, "failure 2");

        let by_kind = history
            .errors_by_kind(ErrorKind::Syntax, 5)
            .await
            .unwrap();
        assert_eq!(by_kind.len(), 1);
        assert!(by_kind[0].fixed);
    }
}
