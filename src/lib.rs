//! # Passage Finder
//!
//! Per-task document indexing and reranked passage retrieval.
//!
//! A *task* is an isolated corpus: a set of reference ("bulk") documents
//! plus the document currently being read ("fresh"). Bulk documents are
//! extracted page by page, cleaned, chunked, embedded, and stored in the
//! task's own vector index. Given a selection of text, the index is
//! searched for nearby passages, which a cross-encoder then reranks.
//!
//! ## Architecture
//!
//! ```text
//!  document ─▶ extract ─▶ normalize ─▶ chunk ─▶ embed ─▶ index (per task)
//!                                                          │
//!  query ─────────────────────────────────────▶ embed ─▶ kNN ─▶ rerank ─▶ top N
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Retrieval error taxonomy |
//! | [`extract`] | Page text extraction (pdf, txt, md, docx, pptx) |
//! | [`normalize`] | Raw page text cleanup |
//! | [`chunk`] | Recursive separator-priority chunking |
//! | [`embedding`] | Embedder abstraction and vector utilities |
//! | [`index`] | Per-task SQLite vector index |
//! | [`rerank`] | Cross-encoder and lexical rerankers |
//! | [`retrieve`] | Indexing and query orchestration |
//! | [`tasks`] | On-disk task store |
//! | [`server`] | HTTP API |
//! | [`logging`] | Tracing subscriber setup |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod rerank;
pub mod retrieve;
pub mod server;
pub mod tasks;
