//! Error taxonomy for the retrieval core.
//!
//! Per-document parse failures are collected into an
//! [`IndexResult`](crate::models::IndexResult) by the orchestrator and never
//! propagate. Every other variant is returned to the caller with enough
//! context (task id, filename) to log and report without re-deriving state.

use thiserror::Error;

/// Errors produced by the retrieval pipeline.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// A document could not be opened or parsed. Non-fatal during indexing.
    #[error("failed to parse document '{filename}': {reason}")]
    DocumentParse { filename: String, reason: String },

    /// The embedding model is not loaded. Fatal until the process restarts.
    #[error("embedding model unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The reranker failed for this query.
    #[error("reranker unavailable: {0}")]
    RerankUnavailable(String),

    /// The query text or parameters were rejected.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The task's persistent vector index could not be opened, read or written.
    #[error("index access failed for task '{task}': {reason}")]
    IndexAccess { task: String, reason: String },

    /// The task name does not resolve to a single path segment.
    #[error("invalid task name: '{0}'")]
    InvalidTaskName(String),

    /// An indexing request produced zero chunks across the whole batch.
    #[error("no chunks were indexed for task '{task}' ({documents_failed} document(s) failed)")]
    NothingIndexed {
        task: String,
        documents_failed: usize,
    },
}

impl RetrievalError {
    pub(crate) fn index_access(task: &str, reason: impl std::fmt::Display) -> Self {
        RetrievalError::IndexAccess {
            task: task.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn parse(filename: &str, reason: impl std::fmt::Display) -> Self {
        RetrievalError::DocumentParse {
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
    }
}
