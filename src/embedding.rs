//! Embedding client abstraction and the HTTP implementation.
//!
//! Defines the [`EmbeddingClient`] trait, an OpenAI-compatible
//! [`HttpEmbeddingClient`] with batching-friendly retry and backoff, and the
//! [`Embedder`] wrapper that slices large inputs into bounded batches.
//!
//! Also provides vector utilities shared with the search index:
//! [`cosine_similarity`], [`vec_to_blob`], and [`blob_to_vec`].
//!
//! # Retry strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) retry
//! - other 4xx fail immediately
//! - network errors retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! A batch is all-or-nothing: a response with the wrong count or wrong
//! dimensions is an error, never a partial result.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// A service that maps texts to fixed-dimension vectors, preserving order.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed one batch. The result has exactly one vector per input text,
    /// in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality this client produces.
    fn dims(&self) -> usize;
}

/// Client for an OpenAI-compatible `POST {url}/embeddings` endpoint.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
    max_retries: u32,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
            api_key: std::env::var(&config.api_key_env).ok(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(attempt, delay_secs = delay.as_secs(), "retrying embedding call");
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .post(format!("{}/embeddings", self.url))
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(ref key) = self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))?;
                        return parse_embedding_response(&json, texts.len(), self.dims);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::EmbeddingUnavailable(format!(
                            "HTTP {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error other than rate limiting: retrying won't help.
                    return Err(Error::EmbeddingUnavailable(format!(
                        "HTTP {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::EmbeddingUnavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::EmbeddingUnavailable("retries exhausted".to_string())))
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Parse `{"data": [{"embedding": [...], "index": n}, ...]}`.
///
/// Entries are reordered by their `index` field when present, and the batch
/// is validated against the expected count and dimensionality.
fn parse_embedding_response(
    json: &serde_json::Value,
    expected_count: usize,
    expected_dims: usize,
) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::EmbeddingUnavailable("response missing data array".to_string()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                Error::EmbeddingUnavailable("response entry missing embedding".to_string())
            })?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);

    let embeddings: Vec<Vec<f32>> = indexed.into_iter().map(|(_, v)| v).collect();

    if embeddings.len() != expected_count {
        return Err(Error::EmbeddingUnavailable(format!(
            "expected {} embeddings, got {}",
            expected_count,
            embeddings.len()
        )));
    }
    for vec in &embeddings {
        if vec.len() != expected_dims {
            return Err(Error::EmbeddingUnavailable(format!(
                "expected {} dims, got {}",
                expected_dims,
                vec.len()
            )));
        }
    }

    Ok(embeddings)
}

/// Batching wrapper over an [`EmbeddingClient`].
///
/// Splits input into batches of at most `batch_size`, runs the batches
/// concurrently (they are independent), and reassembles the results in
/// input order. A single failed batch fails the whole call.
#[derive(Clone)]
pub struct Embedder {
    client: Arc<dyn EmbeddingClient>,
    batch_size: usize,
}

impl Embedder {
    pub fn new(client: Arc<dyn EmbeddingClient>, batch_size: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
        }
    }

    pub fn dims(&self) -> usize {
        self.client.dims()
    }

    /// Embed all texts, preserving input order across batches.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let futures = texts.chunks(self.batch_size).map(|batch| self.client.embed(batch));
        let batches = futures_util::future::try_join_all(futures).await?;
        Ok(batches.into_iter().flatten().collect())
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.client.embed(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingUnavailable("empty embedding response".to_string()))
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB of little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
