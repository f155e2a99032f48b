//! Retrieval orchestrator: the two operations the service layer calls.
//!
//! # Indexing
//!
//! ```text
//! Pending ─▶ Extracting ─▶ Normalizing ─▶ Chunking ─▶ Embedding ─▶ Upserting ─▶ Done
//!    └───────────┴─────────────┴──────────────┴────────────┴─────────────┴──▶ Failed
//! ```
//!
//! Documents that fail to extract are recorded in
//! [`IndexResult::documents_failed`] and skipped; the request only fails if
//! no chunks were produced at all, or if embedding or upserting fails.
//!
//! Re-indexing is incremental per document: chunks whose id and text hash
//! are already stored are not re-embedded, and a document's stored chunks
//! that the current run no longer produces are removed. If the index was
//! built with a different embedding model it is cleared first.
//!
//! # Querying
//!
//! 1. Validate the query text and `top_n`.
//! 2. Open the task index; a task with no index returns `[]`.
//! 3. Embed the query and fetch `top_n * overfetch_factor` nearest chunks.
//! 4. Rerank the window and return the best `top_n`, highest score first.
//!
//! A reranker failure fails the query unless
//! `rerank.fallback_to_vector_order` is set, in which case results are
//! scored by cosine similarity instead.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::chunk::chunk_page;
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::RetrievalError;
use crate::extract::{document_name, extract_pages, Pages};
use crate::index::VectorIndex;
use crate::models::{
    Candidate, Chunk, DocumentFailure, IndexResult, IndexedChunk, Page, RankedResult,
};
use crate::normalize::normalize;
use crate::rerank::{create_reranker, Reranker};

/// Resolves a task id to the directory holding its vector index.
///
/// The orchestrator treats the returned path as opaque; task layout is the
/// caller's concern.
pub trait IndexLocator: Send + Sync {
    fn index_dir(&self, task_id: &str) -> Result<PathBuf, RetrievalError>;
}

/// Tunables for indexing and querying.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub embed_batch_size: usize,
    pub upsert_batch_size: usize,
    pub overfetch_factor: usize,
    pub fallback_to_vector_order: bool,
}

impl RetrievalSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_chars: config.chunking.max_chars,
            overlap_chars: config.chunking.overlap_chars,
            embed_batch_size: config.embedding.batch_size,
            upsert_batch_size: config.retrieval.upsert_batch_size,
            overfetch_factor: config.retrieval.overfetch_factor,
            fallback_to_vector_order: config.rerank.fallback_to_vector_order,
        }
    }
}

/// Indexing request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStage {
    Pending,
    Extracting,
    Normalizing,
    Chunking,
    Embedding,
    Upserting,
    Done,
    Failed(String),
}

impl fmt::Display for IndexStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexStage::Pending => write!(f, "pending"),
            IndexStage::Extracting => write!(f, "extracting"),
            IndexStage::Normalizing => write!(f, "normalizing"),
            IndexStage::Chunking => write!(f, "chunking"),
            IndexStage::Embedding => write!(f, "embedding"),
            IndexStage::Upserting => write!(f, "upserting"),
            IndexStage::Done => write!(f, "done"),
            IndexStage::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

struct StageTracker<'a> {
    task_id: &'a str,
    stage: IndexStage,
}

impl<'a> StageTracker<'a> {
    fn new(task_id: &'a str) -> Self {
        tracing::debug!(task = task_id, stage = %IndexStage::Pending, "indexing request created");
        Self {
            task_id,
            stage: IndexStage::Pending,
        }
    }

    fn advance(&mut self, next: IndexStage) {
        tracing::debug!(task = self.task_id, from = %self.stage, to = %next, "indexing stage");
        self.stage = next;
    }
}

/// Owns the loaded models and runs indexing and queries against per-task
/// indexes.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    locator: Arc<dyn IndexLocator>,
    settings: RetrievalSettings,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        locator: Arc<dyn IndexLocator>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            embedder,
            reranker,
            locator,
            settings,
        }
    }

    /// Load the configured models (blocking) and build a retriever.
    pub fn from_config(config: &Config, locator: Arc<dyn IndexLocator>) -> Self {
        Self::new(
            create_embedder(&config.embedding),
            create_reranker(&config.rerank),
            locator,
            RetrievalSettings::from_config(config),
        )
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn reranker(&self) -> &dyn Reranker {
        self.reranker.as_ref()
    }

    /// Extract, chunk, embed and store `paths` into the task's index.
    pub async fn index(
        &self,
        task_id: &str,
        paths: &[PathBuf],
    ) -> Result<IndexResult, RetrievalError> {
        let started = Instant::now();
        let mut tracker = StageTracker::new(task_id);

        match self.run_index(task_id, paths, &mut tracker).await {
            Ok(result) => {
                tracker.advance(IndexStage::Done);
                tracing::info!(
                    task = task_id,
                    documents = paths.len(),
                    chunks = result.chunks_indexed,
                    failed = result.documents_failed.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "indexing complete"
                );
                Ok(result)
            }
            Err(e) => {
                tracker.advance(IndexStage::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_index(
        &self,
        task_id: &str,
        paths: &[PathBuf],
        tracker: &mut StageTracker<'_>,
    ) -> Result<IndexResult, RetrievalError> {
        self.embedder.ensure_available()?;

        tracker.advance(IndexStage::Extracting);
        let mut documents: Vec<Pages> = Vec::with_capacity(paths.len());
        let mut documents_failed = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for path in paths {
            let outcome = extract_blocking(path).await.and_then(|pages| {
                if seen.insert(pages.document_name().to_string()) {
                    Ok(pages)
                } else {
                    Err(RetrievalError::parse(
                        pages.document_name(),
                        "duplicate document name",
                    ))
                }
            });
            match outcome {
                Ok(pages) => documents.push(pages),
                Err(e) => {
                    let failure = failure_for(path, e);
                    tracing::warn!(
                        task = task_id,
                        document = %failure.filename,
                        reason = %failure.reason,
                        "skipping document"
                    );
                    documents_failed.push(failure);
                }
            }
        }

        tracker.advance(IndexStage::Normalizing);
        let cleaned: Vec<(String, Vec<Page>)> = documents
            .into_iter()
            .map(|doc| {
                let name = doc.document_name().to_string();
                let pages = doc
                    .into_iter()
                    .map(|page| Page {
                        text: normalize(&page.text),
                        ..page
                    })
                    .collect();
                (name, pages)
            })
            .collect();

        tracker.advance(IndexStage::Chunking);
        let mut by_document: Vec<(String, Vec<Chunk>)> = Vec::with_capacity(cleaned.len());
        for (name, pages) in &cleaned {
            let chunks: Vec<Chunk> = pages
                .iter()
                .flat_map(|page| {
                    chunk_page(
                        task_id,
                        &page.document_name,
                        page.page_number,
                        &page.text,
                        self.settings.max_chars,
                        self.settings.overlap_chars,
                    )
                })
                .collect();
            if chunks.is_empty() {
                tracing::debug!(task = task_id, document = %name, "document produced no chunks");
            }
            by_document.push((name.clone(), chunks));
        }
        if by_document.iter().all(|(_, chunks)| chunks.is_empty()) {
            return Err(RetrievalError::NothingIndexed {
                task: task_id.to_string(),
                documents_failed: documents_failed.len(),
            });
        }

        let dir = self.locator.index_dir(task_id)?;
        let index = VectorIndex::open_or_create(task_id, &dir).await?;
        let outcome = self
            .embed_and_upsert(task_id, &index, &by_document, tracker)
            .await;
        index.close().await;
        let chunks_indexed = outcome?;

        Ok(IndexResult {
            chunks_indexed,
            documents_failed,
        })
    }

    async fn embed_and_upsert(
        &self,
        task_id: &str,
        index: &VectorIndex,
        by_document: &[(String, Vec<Chunk>)],
        tracker: &mut StageTracker<'_>,
    ) -> Result<usize, RetrievalError> {
        let model = self.embedder.model_name();
        match index.model().await? {
            Some(existing) if existing == model => {}
            Some(existing) => {
                tracing::info!(
                    task = task_id,
                    previous = %existing,
                    current = %model,
                    "embedding model changed, clearing index"
                );
                index.clear().await?;
                index.set_model(model, self.embedder.dims()).await?;
            }
            None => index.set_model(model, self.embedder.dims()).await?,
        }

        tracker.advance(IndexStage::Embedding);
        let mut pending: Vec<Chunk> = Vec::new();
        let mut unchanged = 0usize;
        for (name, chunks) in by_document {
            let stored: HashMap<String, String> = index.stored_hashes(name).await?;
            for chunk in chunks {
                if stored.get(&chunk.id) == Some(&chunk.hash) {
                    unchanged += 1;
                } else {
                    pending.push(chunk.clone());
                }
            }
        }
        tracing::debug!(
            task = task_id,
            to_embed = pending.len(),
            unchanged,
            "embedding chunks"
        );

        let mut entries = Vec::with_capacity(pending.len());
        for batch in pending.chunks(self.settings.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embed_blocking(Arc::clone(&self.embedder), texts).await?;
            if vectors.len() != batch.len() {
                return Err(RetrievalError::EmbeddingUnavailable(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            entries.extend(
                batch
                    .iter()
                    .cloned()
                    .zip(vectors)
                    .map(|(chunk, vector)| IndexedChunk { chunk, vector }),
            );
        }

        tracker.advance(IndexStage::Upserting);
        for (name, chunks) in by_document {
            let keep: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
            let removed = index.remove_stale(name, &keep).await?;
            if removed > 0 {
                tracing::debug!(task = task_id, document = %name, removed, "removed stale chunks");
            }
        }
        index
            .upsert(&entries, self.settings.upsert_batch_size)
            .await?;
        Ok(unchanged + entries.len())
    }

    /// Top `top_n` passages for `query_text` in the task, best first.
    pub async fn query(
        &self,
        task_id: &str,
        query_text: &str,
        top_n: usize,
    ) -> Result<Vec<RankedResult>, RetrievalError> {
        let started = Instant::now();
        let query = query_text.trim();
        if query.is_empty() {
            return Err(RetrievalError::InvalidQuery(
                "query text is empty".to_string(),
            ));
        }
        if top_n == 0 {
            return Err(RetrievalError::InvalidQuery(
                "top_n must be at least 1".to_string(),
            ));
        }

        let dir = self.locator.index_dir(task_id)?;
        let index = VectorIndex::open_existing(task_id, &dir).await?;
        let candidates = match self.fetch_candidates(task_id, &index, query, top_n).await {
            Ok(candidates) => candidates,
            Err(e) => {
                index.close().await;
                return Err(e);
            }
        };
        index.close().await;
        if candidates.is_empty() {
            tracing::debug!(task = task_id, "index is empty, no results");
            return Ok(Vec::new());
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let scores = match rerank_blocking(Arc::clone(&self.reranker), query.to_string(), texts)
            .await
        {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                return Err(RetrievalError::RerankUnavailable(format!(
                    "reranker returned {} scores for {} candidates",
                    scores.len(),
                    candidates.len()
                )))
            }
            Err(e) if self.settings.fallback_to_vector_order => {
                tracing::warn!(
                    task = task_id,
                    error = %e,
                    "reranker failed, falling back to vector order"
                );
                candidates.iter().map(|c| 1.0 - c.distance).collect()
            }
            Err(e) => return Err(e),
        };

        let mut results: Vec<RankedResult> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| RankedResult {
                document_name: candidate.document_name,
                page_number: candidate.page_number,
                text: candidate.text,
                score,
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(top_n);

        tracing::info!(
            task = task_id,
            top_n,
            returned = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query complete"
        );
        Ok(results)
    }

    async fn fetch_candidates(
        &self,
        task_id: &str,
        index: &VectorIndex,
        query: &str,
        top_n: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        if index.count().await? == 0 {
            return Ok(Vec::new());
        }
        let model = self.embedder.model_name();
        if let Some(stored) = index.model().await? {
            if stored != model {
                return Err(RetrievalError::index_access(
                    task_id,
                    format!(
                        "index was built with embedding model '{}' but the query uses '{}'",
                        stored, model
                    ),
                ));
            }
        }
        let vector = embed_one_blocking(Arc::clone(&self.embedder), query.to_string()).await?;
        let window = top_n.saturating_mul(self.settings.overfetch_factor.max(1));
        index.query(&vector, window).await
    }
}

async fn extract_blocking(path: &Path) -> Result<Pages, RetrievalError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_pages(&owned))
        .await
        .map_err(|e| RetrievalError::parse(&document_name(path), e))?
}

async fn embed_blocking(
    embedder: Arc<dyn Embedder>,
    texts: Vec<String>,
) -> Result<Vec<Vec<f32>>, RetrievalError> {
    tokio::task::spawn_blocking(move || embedder.embed(&texts))
        .await
        .map_err(|e| RetrievalError::EmbeddingUnavailable(format!("embedding task failed: {}", e)))?
}

async fn embed_one_blocking(
    embedder: Arc<dyn Embedder>,
    text: String,
) -> Result<Vec<f32>, RetrievalError> {
    tokio::task::spawn_blocking(move || embedder.embed_one(&text))
        .await
        .map_err(|e| RetrievalError::EmbeddingUnavailable(format!("embedding task failed: {}", e)))?
}

async fn rerank_blocking(
    reranker: Arc<dyn Reranker>,
    query: String,
    texts: Vec<String>,
) -> Result<Vec<f32>, RetrievalError> {
    tokio::task::spawn_blocking(move || reranker.score(&query, &texts))
        .await
        .map_err(|e| RetrievalError::RerankUnavailable(format!("rerank task failed: {}", e)))?
}

fn failure_for(path: &Path, error: RetrievalError) -> DocumentFailure {
    match error {
        RetrievalError::DocumentParse { filename, reason } => DocumentFailure { filename, reason },
        other => DocumentFailure {
            filename: document_name(path),
            reason: other.to_string(),
        },
    }
}
