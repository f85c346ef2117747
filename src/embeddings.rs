//! Embedding provider client and vector encoding.
//!
//! Vectors are 768-dimension f32 arrays stored as little-endian blobs in
//! the `item_embeddings` side table. The HTTP provider is behind a trait so
//! the import pipeline and search run against a deterministic in-process
//! provider in tests and offline bring-up.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::warn;

use crate::config::Secret;
use crate::error::{PosError, PosResult};

/// Fixed embedding dimensionality.
pub const EMBEDDING_DIMS: usize = 768;

/// Anything that can embed catalog text.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> PosResult<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// Vector encoding
// ---------------------------------------------------------------------------

/// Encode a vector as a little-endian f32 blob.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 blob back into a vector.
pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine distance between two vectors (0 = identical, 2 = opposite).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 2.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// SHA-256 hex digest of a semantic string, for content-addressed reuse.
pub fn semantic_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Blocking HTTP client against the external embedding service.
pub struct HttpEmbeddingProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: Secret,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: String, api_key: Secret, timeout: Duration) -> PosResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PosError::Internal(format!("embedding client: {e}")))?;
        Ok(HttpEmbeddingProvider {
            client,
            base_url,
            api_key,
        })
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, text: &str) -> PosResult<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .json(&json!({ "input": text, "dimensions": EMBEDDING_DIMS }))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Embedding request rejected");
            return Err(PosError::Internal(format!(
                "embedding provider returned {status}"
            )));
        }

        let body: Value = response.json()?;
        let vector: Vec<f32> = body
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| PosError::Internal("embedding response missing vector".into()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if vector.len() != EMBEDDING_DIMS {
            return Err(PosError::Internal(format!(
                "embedding has {} dims, expected {EMBEDDING_DIMS}",
                vector.len()
            )));
        }
        Ok(vector)
    }
}

// ---------------------------------------------------------------------------
// In-process provider
// ---------------------------------------------------------------------------

/// Deterministic hash-derived embeddings for tests and offline bring-up.
///
/// Identical text maps to identical vectors, so content-addressed reuse and
/// similarity-of-self behave realistically without a network dependency.
pub struct HashEmbeddingProvider;

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> PosResult<Vec<f32>> {
        let mut vector = Vec::with_capacity(EMBEDDING_DIMS);
        let mut seed = Sha256::digest(text.as_bytes()).to_vec();
        while vector.len() < EMBEDDING_DIMS {
            for byte in &seed {
                if vector.len() >= EMBEDDING_DIMS {
                    break;
                }
                vector.push((*byte as f32 - 127.5) / 127.5);
            }
            seed = Sha256::digest(&seed).to_vec();
        }
        Ok(vector)
    }
}

/// Provider that counts calls; lets tests assert embedding reuse.
#[cfg(test)]
pub struct CountingProvider {
    pub calls: std::sync::atomic::AtomicUsize,
    inner: HashEmbeddingProvider,
}

#[cfg(test)]
impl CountingProvider {
    pub fn new() -> Self {
        CountingProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
            inner: HashEmbeddingProvider,
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl EmbeddingProvider for CountingProvider {
    fn embed(&self, text: &str) -> PosResult<Vec<f32>> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.embed(text)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
