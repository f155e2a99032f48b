//! Second-stage relevance scoring of (query, passage) pairs.
//!
//! A [`Reranker`] scores each candidate independently against the query;
//! higher is more relevant. Scores are only comparable within one call.
//!
//! - **[`CrossEncoderReranker`]** runs a cross-encoder model via fastembed.
//! - **[`LexicalReranker`]** is a deterministic term-overlap scorer with no
//!   model files.
//! - **[`DisabledReranker`]** fails every call with
//!   [`RetrievalError::RerankUnavailable`].

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RerankConfig;
use crate::embedding::tokenize;
use crate::error::RetrievalError;

pub trait Reranker: Send + Sync {
    fn model_name(&self) -> &str;

    /// One score per candidate, in candidate order.
    fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, RetrievalError>;
}

pub struct DisabledReranker {
    reason: String,
}

impl DisabledReranker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Reranker for DisabledReranker {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn score(&self, _query: &str, _candidates: &[String]) -> Result<Vec<f32>, RetrievalError> {
        Err(RetrievalError::RerankUnavailable(self.reason.clone()))
    }
}

/// Term-overlap scorer.
///
/// For each distinct query term present in the passage, adds
/// `1 + ln(1 + tf)`; the sum is divided by the number of distinct query
/// terms. Passages covering more of the query score higher, and repeated
/// terms help with diminishing returns.
pub struct LexicalReranker;

impl Reranker for LexicalReranker {
    fn model_name(&self) -> &str {
        "lexical"
    }

    fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, RetrievalError> {
        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(query).filter(|t| seen.insert(t.clone())).collect();
        if terms.is_empty() {
            return Ok(vec![0.0; candidates.len()]);
        }

        Ok(candidates
            .iter()
            .map(|passage| {
                let tokens: Vec<String> = tokenize(passage).collect();
                let total: f32 = terms
                    .iter()
                    .map(|term| {
                        let tf = tokens.iter().filter(|t| *t == term).count();
                        if tf == 0 {
                            0.0
                        } else {
                            1.0 + (1.0 + tf as f32).ln()
                        }
                    })
                    .sum();
                total / terms.len() as f32
            })
            .collect())
    }
}

/// Cross-encoder reranker run in-process via fastembed.
#[cfg(feature = "local-models")]
pub struct CrossEncoderReranker {
    model_name: String,
    batch_size: usize,
    model: std::sync::Mutex<fastembed::TextRerank>,
}

#[cfg(feature = "local-models")]
impl CrossEncoderReranker {
    /// Load the configured model. Blocks while the model downloads.
    pub fn load(config: &RerankConfig) -> Result<Self, RetrievalError> {
        let fastembed_model = config_to_reranker_model(&config.model)?;
        let model = fastembed::TextRerank::try_new(
            fastembed::RerankInitOptions::new(fastembed_model).with_show_download_progress(true),
        )
        .map_err(|e| {
            RetrievalError::RerankUnavailable(format!(
                "failed to initialize reranker model '{}': {}",
                config.model, e
            ))
        })?;
        Ok(Self {
            model_name: config.model.clone(),
            batch_size: config.batch_size,
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "local-models")]
impl Reranker for CrossEncoderReranker {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, RetrievalError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let documents: Vec<&str> = candidates.iter().map(String::as_str).collect();
        let mut model = self
            .model
            .lock()
            .map_err(|_| RetrievalError::RerankUnavailable("reranker lock poisoned".into()))?;
        let results = model
            .rerank(query, documents, false, Some(self.batch_size))
            .map_err(|e| RetrievalError::RerankUnavailable(format!("rerank failed: {}", e)))?;

        // Results come back sorted by score; restore candidate order.
        let mut scores = vec![f32::NAN; candidates.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        if scores.iter().any(|s| s.is_nan()) {
            return Err(RetrievalError::RerankUnavailable(format!(
                "reranker returned incomplete scores for {} candidates",
                candidates.len()
            )));
        }
        Ok(scores)
    }
}

#[cfg(feature = "local-models")]
fn config_to_reranker_model(name: &str) -> Result<fastembed::RerankerModel, RetrievalError> {
    match name {
        "bge-reranker-base" => Ok(fastembed::RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" => Ok(fastembed::RerankerModel::BGERerankerV2M3),
        "jina-reranker-v1-turbo-en" => Ok(fastembed::RerankerModel::JINARerankerV1TurboEn),
        other => Err(RetrievalError::RerankUnavailable(format!(
            "unknown reranker model: '{}'. Supported models: \
             bge-reranker-base, bge-reranker-v2-m3, jina-reranker-v1-turbo-en",
            other
        ))),
    }
}

/// Create the configured [`Reranker`].
///
/// | Config Value | Reranker |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledReranker`] |
/// | `"lexical"` | [`LexicalReranker`] |
/// | `"local"` | [`CrossEncoderReranker`] (requires the `local-models` feature) |
///
/// A model that fails to load is logged once and degrades to a
/// [`DisabledReranker`].
pub fn create_reranker(config: &RerankConfig) -> Arc<dyn Reranker> {
    match config.provider.as_str() {
        "lexical" => Arc::new(LexicalReranker),
        "local" => load_local(config),
        "disabled" => Arc::new(DisabledReranker::new("rerank provider is disabled")),
        other => Arc::new(DisabledReranker::new(format!(
            "unknown rerank provider: '{}'",
            other
        ))),
    }
}

#[cfg(feature = "local-models")]
fn load_local(config: &RerankConfig) -> Arc<dyn Reranker> {
    let started = std::time::Instant::now();
    match CrossEncoderReranker::load(config) {
        Ok(reranker) => {
            tracing::info!(
                model = %config.model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "reranker model loaded"
            );
            Arc::new(reranker)
        }
        Err(e) => {
            tracing::error!(model = %config.model, error = %e, "reranker model failed to load");
            Arc::new(DisabledReranker::new(e.to_string()))
        }
    }
}

#[cfg(not(feature = "local-models"))]
fn load_local(config: &RerankConfig) -> Arc<dyn Reranker> {
    let reason = "local rerank provider requires the `local-models` feature";
    tracing::error!(model = %config.model, "{}", reason);
    Arc::new(DisabledReranker::new(reason))
}
