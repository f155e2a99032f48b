//! Embedder abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`LocalEmbedder`]** runs a sentence-embedding model locally via fastembed.
//!   The model is loaded once; after the initial download no network calls are made.
//! - **[`HashEmbedder`]** is a deterministic feature-hashing embedder with no
//!   model files. Useful offline and in tests.
//! - **[`DisabledEmbedder`]** fails every call with
//!   [`RetrievalError::EmbeddingUnavailable`]. This is the state a failed
//!   model load degrades into.
//!
//! Also provides vector utilities used by the index:
//! - [`cosine_similarity`] computes similarity between two vectors
//! - [`vec_to_blob`] encodes a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`] decodes a SQLite BLOB back into a `Vec<f32>`
//!
//! # Selection
//!
//! ```rust
//! # use passage_finder::config::EmbeddingConfig;
//! # use passage_finder::embedding::create_embedder;
//! let config = EmbeddingConfig {
//!     provider: "hash".to_string(),
//!     ..Default::default()
//! };
//! let embedder = create_embedder(&config);
//! assert_eq!(embedder.dims(), 384);
//! assert!(embedder.ensure_available().is_ok());
//! ```

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::RetrievalError;

/// Maps text to fixed-dimension vectors.
///
/// The same text always maps to the same vector for a loaded model, and
/// every vector has length [`dims`](Embedder::dims). Implementations are
/// synchronous; async callers run them on a blocking thread.
pub trait Embedder: Send + Sync {
    /// Model identifier recorded alongside the index.
    fn model_name(&self) -> &str;

    /// Embedding dimensionality.
    fn dims(&self) -> usize;

    /// Fails with [`RetrievalError::EmbeddingUnavailable`] if the model is
    /// not loaded.
    fn ensure_available(&self) -> Result<(), RetrievalError> {
        Ok(())
    }

    /// Embed a batch of texts, one vector per input in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    /// Embed a single text.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        self.embed(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::EmbeddingUnavailable("empty embedding response".into()))
    }
}

// ============ Disabled ============

/// Embedder that refuses every call. Used when `embedding.provider =
/// "disabled"` or when the configured model failed to load.
pub struct DisabledEmbedder {
    reason: String,
}

impl DisabledEmbedder {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn ensure_available(&self) -> Result<(), RetrievalError> {
        Err(RetrievalError::EmbeddingUnavailable(self.reason.clone()))
    }
    fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Err(RetrievalError::EmbeddingUnavailable(self.reason.clone()))
    }
}

// ============ Hash ============

/// Deterministic bag-of-words embedder using signed feature hashing.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a +/-1 sign; the result is L2-normalized. Texts that
/// share vocabulary land close together under cosine similarity.
pub struct HashEmbedder {
    model_name: String,
    dims: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIMS: usize = 384;

    pub fn new(dims: usize) -> Self {
        Self {
            model_name: format!("hash-{}", dims),
            dims: dims.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercase alphanumeric tokens.
pub(crate) fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

// ============ Local (fastembed) ============

/// Sentence-embedding model run in-process via fastembed.
///
/// Models are downloaded on first use from Hugging Face and cached.
#[cfg(feature = "local-models")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: std::sync::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-models")]
impl LocalEmbedder {
    /// Load the configured model. Blocks while the model downloads.
    pub fn load(config: &EmbeddingConfig) -> Result<Self, RetrievalError> {
        let (model_name, dims) = resolve_local_model(config);
        let fastembed_model = config_to_fastembed_model(&model_name)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
        )
        .map_err(|e| {
            RetrievalError::EmbeddingUnavailable(format!(
                "failed to initialize local embedding model '{}': {}",
                model_name, e
            ))
        })?;

        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "local-models")]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = self
            .model
            .lock()
            .map_err(|_| RetrievalError::EmbeddingUnavailable("embedding model lock poisoned".into()))?;
        model
            .embed(texts.to_vec(), Some(self.batch_size))
            .map_err(|e| RetrievalError::EmbeddingUnavailable(format!("local embedding failed: {}", e)))
    }
}

/// Model name and dimensionality, inferring dims from the model name when
/// the config does not set them.
fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config.model.clone();
    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-small" => 384,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    });
    (model_name, dims)
}

#[cfg(feature = "local-models")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel, RetrievalError> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(RetrievalError::EmbeddingUnavailable(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"hash"` | [`HashEmbedder`] |
/// | `"local"` | [`LocalEmbedder`] (requires the `local-models` feature) |
///
/// Never fails: if the local model cannot be loaded the failure is logged
/// once and a [`DisabledEmbedder`] carrying the reason is returned, so
/// every later call reports [`RetrievalError::EmbeddingUnavailable`].
pub fn create_embedder(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    match config.provider.as_str() {
        "hash" => Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(HashEmbedder::DEFAULT_DIMS),
        )),
        "local" => load_local(config),
        "disabled" => Arc::new(DisabledEmbedder::new("embedding provider is disabled")),
        other => Arc::new(DisabledEmbedder::new(format!(
            "unknown embedding provider: '{}'",
            other
        ))),
    }
}

#[cfg(feature = "local-models")]
fn load_local(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    let started = std::time::Instant::now();
    match LocalEmbedder::load(config) {
        Ok(embedder) => {
            tracing::info!(
                model = %embedder.model_name,
                dims = embedder.dims,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "embedding model loaded"
            );
            Arc::new(embedder)
        }
        Err(e) => {
            tracing::error!(model = %config.model, error = %e, "embedding model failed to load");
            Arc::new(DisabledEmbedder::new(e.to_string()))
        }
    }
}

#[cfg(not(feature = "local-models"))]
fn load_local(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    let reason = "local embedding provider requires the `local-models` feature";
    tracing::error!(model = %config.model, "{}", reason);
    Arc::new(DisabledEmbedder::new(reason))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use passage_finder::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
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

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different
/// lengths.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_config() -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "hash".to_string(),
            dims: Some(128),
            ..Default::default()
        }
    }

    #[test]
    fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(128);
        let a = embedder.embed_one("Gradient descent updates weights").unwrap();
        let b = embedder.embed_one("Gradient descent updates weights").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
    }

    #[test]
    fn hash_embedder_vectors_are_unit_length() {
        let embedder = HashEmbedder::new(64);
        let v = embedder.embed_one("some words here").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_ranks_shared_vocabulary_closer() {
        let embedder = HashEmbedder::new(384);
        let query = embedder.embed_one("gradient descent").unwrap();
        let related = embedder
            .embed_one("Gradient descent updates weights step by step.")
            .unwrap();
        let unrelated = embedder
            .embed_one("Simmer the tomatoes with garlic and basil.")
            .unwrap();
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn hash_embedder_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(16);
        let v = embedder.embed_one("").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn batch_preserves_order() {
        let embedder = HashEmbedder::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let batch = embedder.embed(&texts).unwrap();
        assert_eq!(batch[0], embedder.embed_one("alpha").unwrap());
        assert_eq!(batch[1], embedder.embed_one("beta").unwrap());
    }

    #[test]
    fn disabled_embedder_reports_unavailable() {
        let embedder = DisabledEmbedder::new("model missing");
        assert!(matches!(
            embedder.ensure_available(),
            Err(RetrievalError::EmbeddingUnavailable(reason)) if reason == "model missing"
        ));
        assert!(matches!(
            embedder.embed_one("x"),
            Err(RetrievalError::EmbeddingUnavailable(_))
        ));
    }

    #[test]
    fn create_embedder_selects_provider() {
        let hash = create_embedder(&hash_config());
        assert_eq!(hash.model_name(), "hash-128");
        assert_eq!(hash.dims(), 128);

        let disabled = create_embedder(&EmbeddingConfig {
            provider: "disabled".to_string(),
            ..Default::default()
        });
        assert!(disabled.ensure_available().is_err());
    }

    #[test]
    fn resolve_dims_from_model_name() {
        let config = EmbeddingConfig {
            model: "bge-base-en-v1.5".to_string(),
            ..Default::default()
        };
        assert_eq!(resolve_local_model(&config).1, 768);
        let config = EmbeddingConfig {
            dims: Some(42),
            ..Default::default()
        };
        assert_eq!(resolve_local_model(&config).1, 42);
    }

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
