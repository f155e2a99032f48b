//! Core data models that flow through the indexing and query pipelines.

use serde::Serialize;

/// One unit of extracted text from a document, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub document_name: String,
    pub page_number: u32,
    pub text: String,
}

/// The atomic indexed unit: a bounded span of normalized page text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Deterministic id derived from (task, document, page, ordinal).
    pub id: String,
    pub document_name: String,
    pub page_number: u32,
    /// Position of the chunk within its page, starting at 0.
    pub ordinal: u32,
    pub text: String,
    /// SHA-256 of `text`, used to skip re-embedding unchanged chunks.
    pub hash: String,
}

/// A chunk paired with its embedding vector, ready for upsert.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A nearest-neighbour hit returned by the vector index.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub document_name: String,
    pub page_number: u32,
    pub text: String,
    /// Cosine distance (`1 - similarity`); lower is closer.
    pub distance: f32,
}

/// A passage returned from a query, ordered by descending `score`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub document_name: String,
    pub page_number: u32,
    pub text: String,
    pub score: f32,
}

/// A document that could not be indexed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub filename: String,
    pub reason: String,
}

/// Outcome of an indexing request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexResult {
    /// Chunks produced and stored for this batch (including unchanged ones).
    pub chunks_indexed: usize,
    /// Documents skipped because extraction failed.
    pub documents_failed: Vec<DocumentFailure>,
}
