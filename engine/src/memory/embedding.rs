//! Text embedders for the similarity index
//!
//! Vectors are persisted, so an embedder must be deterministic for a given
//! `model_id`. The hashing embedder uses blake3 rather than std's hasher,
//! whose output is allowed to change between Rust releases.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored next to every vector this embedder produces
    fn model_id(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Build the embedder named by `memory.embedding_model`
///
/// Returns `None` for "none", which puts retrieval in degraded mode.
pub fn embedder_from_config(config: &Config) -> Result<Option<Arc<dyn Embedder>>> {
    let model = config.memory.embedding_model.as_str();
    if model == "none" {
        return Ok(None);
    }
    if model == "hashing" {
        return Ok(Some(Arc::new(HashingEmbedder::new(
            config.memory.embedding_dimensions,
        ))));
    }
    if let Some(name) = model.strip_prefix("ollama:") {
        let embedder = OllamaEmbedder::new(
            &config.llm.ollama.base_url,
            name,
            Duration::from_secs(config.llm.request_timeout_secs),
        )?;
        return Ok(Some(Arc::new(embedder)));
    }
    bail!("Unknown embedding model: {}", model)
}

/// Deterministic feature-hashing embedder
///
/// Features are lowercase word unigrams and adjacent bigrams. Each feature
/// adds +1 or -1 to one bucket, chosen by its blake3 digest, and the result
/// is L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            model_id: format!("hashing-{}", dimensions.max(1)),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let words = tokenize(text);

        let bigrams = words.windows(2).map(|pair| format!("{} {}", pair[0], pair[1]));
        for feature in words.iter().cloned().chain(bigrams) {
            let digest = blake3::hash(feature.as_bytes());
            let bytes = digest.as_bytes();
            let mut index_bytes = [0u8; 8];
            index_bytes.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(index_bytes) % self.dimensions as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Embedder backed by Ollama's `/api/embeddings`
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    model_id: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            model_id: format!("ollama:{}", model),
            client,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .context("Embedding request failed")?;

        if !response.status().is_success() {
            bail!("Embedding endpoint returned {}", response.status());
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;
        if body.embedding.is_empty() {
            bail!("Embedding endpoint returned an empty vector");
        }
        Ok(body.embedding)
    }
}

/// Cosine distance in [0, 2]
///
/// Vectors of different length or zero magnitude are maximally unrelated
/// (distance 1.0) rather than an error.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        return 1.0;
    }
    1.0 - (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}
