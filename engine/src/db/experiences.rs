/// Similarity index storage
///
/// Vectors are stored as little-endian f32 blobs next to the name of the
/// model that produced them. Retrieval only ever compares vectors of the
/// same model, so switching embedders leaves old rows inert instead of
/// producing meaningless distances.
use anyhow::{bail, Context, Result};
use sdk::types::Experience;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::unix_now;

/// Input for one experience row
#[derive(Debug, Clone)]
pub struct NewExperience {
    pub task_id: String,
    pub step_id: Option<String>,
    pub task_type: String,
    pub pattern: String,
    pub outcome: String,
    /// Vector and the model that produced it; `None` in degraded mode
    pub embedding: Option<(Vec<f32>, String)>,
}

/// Experience repository for database operations
#[derive(Clone)]
pub struct ExperienceRepository {
    pool: SqlitePool,
}

impl ExperienceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store an experience and return its row id
    pub async fn insert(&self, experience: &NewExperience) -> Result<i64> {
        let now = unix_now()?;
        let (blob, model) = match &experience.embedding {
            Some((vector, model)) => (Some(encode_vector(vector)), Some(model.as_str())),
            None => (None, None),
        };

        let result = sqlx::query(
            "INSERT INTO experiences (task_id, step_id, task_type, pattern, outcome,
                                      embedding, embedding_model, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&experience.task_id)
        .bind(&experience.step_id)
        .bind(&experience.task_type)
        .bind(&experience.pattern)
        .bind(&experience.outcome)
        .bind(blob)
        .bind(model)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert experience")?;

        Ok(result.last_insert_rowid())
    }

    /// Newest experiences with a vector from `model`, newest first
    pub async fn recent_with_embedding(&self, model: &str, limit: i64) -> Result<Vec<Experience>> {
        let rows = sqlx::query(
            "SELECT id, task_id, step_id, task_type, pattern, outcome, embedding, created_at
             FROM experiences
             WHERE embedding_model = ? AND embedding IS NOT NULL
             ORDER BY id DESC LIMIT ?",
        )
        .bind(model)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read experiences")?;

        rows.iter().map(experience_from_row).collect()
    }

    /// All experiences recorded for a task, oldest first
    pub async fn for_task(&self, task_id: &str) -> Result<Vec<Experience>> {
        let rows = sqlx::query(
            "SELECT id, task_id, step_id, task_type, pattern, outcome, embedding, created_at
             FROM experiences WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read task experiences")?;

        rows.iter().map(experience_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM experiences")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count experiences")?;
        Ok(count)
    }
}

fn experience_from_row(row: &SqliteRow) -> Result<Experience> {
    let blob: Option<Vec<u8>> = row.get("embedding");
    let embedding = match blob {
        Some(bytes) => decode_vector(&bytes)?,
        None => Vec::new(),
    };

    Ok(Experience {
        id: row.get("id"),
        task_id: row.get("task_id"),
        step_id: row.get("step_id"),
        task_type: row.get("task_type"),
        pattern: row.get("pattern"),
        outcome: row.get("outcome"),
        embedding,
        distance: None,
        created_at: row.get("created_at"),
    })
}

pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        bail!("Embedding blob length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
