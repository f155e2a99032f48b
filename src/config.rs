//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all, via [`Config::minimal`]) yields a working local setup.
//!
//! ```toml
//! [tasks]
//! root = "./task"
//!
//! [chunking]
//! max_chars = 500
//! overlap_chars = 50
//!
//! [embedding]
//! provider = "local"          # local | hash | disabled
//! model = "all-minilm-l6-v2"
//!
//! [rerank]
//! provider = "local"          # local | lexical | disabled
//! model = "bge-reranker-base"
//! fallback_to_vector_order = false
//!
//! [retrieval]
//! default_top_n = 5
//! overfetch_factor = 4
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! max_upload_mb = 256
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    #[serde(default = "default_tasks_root")]
    pub root: PathBuf,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            root: default_tasks_root(),
        }
    }
}

fn default_tasks_root() -> PathBuf {
    PathBuf::from("./task")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    500
}
fn default_overlap_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: None,
            batch_size: default_embedding_batch_size(),
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_embedding_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_embedding_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default = "default_rerank_batch_size")]
    pub batch_size: usize,
    /// Serve vector-ordered results when the reranker fails instead of
    /// returning an error.
    #[serde(default)]
    pub fallback_to_vector_order: bool,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            model: default_rerank_model(),
            batch_size: default_rerank_batch_size(),
            fallback_to_vector_order: false,
        }
    }
}

fn default_rerank_provider() -> String {
    "local".to_string()
}
fn default_rerank_model() -> String {
    "bge-reranker-base".to_string()
}
fn default_rerank_batch_size() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_n")]
    pub default_top_n: usize,
    /// Candidate window is `top_n * overfetch_factor`.
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_n: default_top_n(),
            overfetch_factor: default_overfetch_factor(),
            upsert_batch_size: default_upsert_batch_size(),
        }
    }
}

fn default_top_n() -> usize {
    5
}
fn default_overfetch_factor() -> usize {
    4
}
fn default_upsert_batch_size() -> usize {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Request body limit for uploads, in MiB.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_max_upload_mb() -> usize {
    256
}

impl Config {
    /// Built-in defaults, used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to [`Config::minimal`].
pub fn load_or_minimal(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::minimal())
    }
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!(
            "chunking.overlap_chars ({}) must be < chunking.max_chars ({})",
            config.chunking.overlap_chars,
            config.chunking.max_chars
        );
    }

    // Validate retrieval
    if config.retrieval.default_top_n == 0 {
        anyhow::bail!("retrieval.default_top_n must be >= 1");
    }
    if config.retrieval.overfetch_factor == 0 {
        anyhow::bail!("retrieval.overfetch_factor must be >= 1");
    }
    if config.retrieval.upsert_batch_size == 0 {
        anyhow::bail!("retrieval.upsert_batch_size must be > 0");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "local" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, or hash.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate rerank
    match config.rerank.provider.as_str() {
        "disabled" | "local" | "lexical" => {}
        other => anyhow::bail!(
            "Unknown rerank provider: '{}'. Must be disabled, local, or lexical.",
            other
        ),
    }
    if config.rerank.batch_size == 0 {
        anyhow::bail!("rerank.batch_size must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_uses_defaults() {
        let file = write_config("");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.tasks.root, PathBuf::from("./task"));
        assert_eq!(config.chunking.max_chars, 500);
        assert_eq!(config.chunking.overlap_chars, 50);
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.embedding.model, "all-minilm-l6-v2");
        assert_eq!(config.rerank.provider, "local");
        assert!(!config.rerank.fallback_to_vector_order);
        assert_eq!(config.retrieval.default_top_n, 5);
        assert_eq!(config.retrieval.overfetch_factor, 4);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let file = write_config(
            r#"
[embedding]
provider = "hash"
dims = 64

[rerank]
provider = "lexical"
fallback_to_vector_order = true
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.dims, Some(64));
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.rerank.provider, "lexical");
        assert!(config.rerank.fallback_to_vector_order);
        assert_eq!(config.rerank.model, "bge-reranker-base");
    }

    #[test]
    fn rejects_unknown_providers() {
        let file = write_config("[embedding]\nprovider = \"openai\"\n");
        let err = load_config(file.path()).unwrap_err().to_string();
        assert!(err.contains("Unknown embedding provider"), "{}", err);

        let file = write_config("[rerank]\nprovider = \"cohere\"\n");
        let err = load_config(file.path()).unwrap_err().to_string();
        assert!(err.contains("Unknown rerank provider"), "{}", err);
    }

    #[test]
    fn rejects_overlap_not_below_max() {
        let file = write_config("[chunking]\nmax_chars = 100\noverlap_chars = 100\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn rejects_zero_overfetch() {
        let file = write_config("[retrieval]\noverfetch_factor = 0\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn missing_file_falls_back_to_minimal() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_minimal(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.chunking.max_chars, 500);
    }

    #[test]
    fn missing_file_is_an_error_for_load_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("absent.toml")).is_err());
    }
}
