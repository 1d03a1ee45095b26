/// Append-only version log
///
/// One entry per accepted step artifact. The table carries triggers that
/// abort any UPDATE or DELETE, so rollback is a read of the chain prefix and
/// never rewrites history.
use anyhow::{anyhow, Context, Result};
use sdk::types::{Step, VersionEntry};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::unix_now;

/// Version log handle
#[derive(Clone)]
pub struct VersionLog {
    pool: SqlitePool,
}

impl VersionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append the accepted artifact of `step` to the task's chain
    pub async fn commit(&self, task_id: &str, step: &Step, artifact: &str) -> Result<VersionEntry> {
        let now = unix_now()?;
        let artifact_hash = blake3::hash(artifact.as_bytes()).to_hex().to_string();

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM versions WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to read version chain head")?;
        let sequence = last.unwrap_or(0) + 1;
        let commit_message = format!(
            "[forge] step {}: {}",
            step.sequence_index + 1,
            step.description
        );

        let result = sqlx::query(
            "INSERT INTO versions (task_id, step_id, sequence, artifact, artifact_hash,
                                   commit_message, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(&step.id)
        .bind(sequence)
        .bind(artifact)
        .bind(&artifact_hash)
        .bind(&commit_message)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to append version entry")?;

        tx.commit().await.context("Failed to commit version entry")?;

        Ok(VersionEntry {
            id: result.last_insert_rowid(),
            task_id: task_id.to_string(),
            step_id: step.id.clone(),
            sequence: sequence as u32,
            artifact: artifact.to_string(),
            artifact_hash,
            commit_message,
            created_at: now,
        })
    }

    /// The task's chain in commit order
    pub async fn history(&self, task_id: &str) -> Result<Vec<VersionEntry>> {
        let rows = sqlx::query(
            "SELECT id, task_id, step_id, sequence, artifact, artifact_hash, commit_message,
                    created_at
             FROM versions WHERE task_id = ? ORDER BY sequence ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read version history")?;

        Ok(rows.iter().map(entry_from_row).collect())
    }

    pub async fn entry(&self, task_id: &str, step_id: &str) -> Result<Option<VersionEntry>> {
        let row = sqlx::query(
            "SELECT id, task_id, step_id, sequence, artifact, artifact_hash, commit_message,
                    created_at
             FROM versions WHERE task_id = ? AND step_id = ?",
        )
        .bind(task_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read version entry")?;

        Ok(row.as_ref().map(entry_from_row))
    }

    /// Chain prefix ending at the entry of `step_id`
    ///
    /// Replaying the returned artifacts in order reproduces the project as
    /// it was right after that step was accepted.
    pub async fn rollback_to(&self, task_id: &str, step_id: &str) -> Result<Vec<VersionEntry>> {
        let target = self
            .entry(task_id, step_id)
            .await?
            .ok_or_else(|| anyhow!("No version entry for step {} of task {}", step_id, task_id))?;

        let mut chain = self.history(task_id).await?;
        chain.retain(|e| e.sequence <= target.sequence);
        Ok(chain)
    }

    pub async fn count(&self, task_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM versions WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count version entries")?;
        Ok(count as usize)
    }
}

fn entry_from_row(row: &SqliteRow) -> VersionEntry {
    VersionEntry {
        id: row.get("id"),
        task_id: row.get("task_id"),
        step_id: row.get("step_id"),
        sequence: row.get::<i64, _>("sequence") as u32,
        artifact: row.get("artifact"),
        artifact_hash: row.get("artifact_hash"),
        commit_message: row.get("commit_message"),
        created_at: row.get("created_at"),
    }
}
