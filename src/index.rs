//! Per-task persistent vector index.
//!
//! Each task owns one SQLite file (`index.sqlite`) inside the index
//! directory its caller hands in. Nothing is shared between tasks, so
//! indexing different tasks concurrently cannot interfere.
//!
//! # Schema
//!
//! ```text
//! index_meta(key TEXT PRIMARY KEY, value TEXT)      -- "model", "dims"
//! chunks(id TEXT PRIMARY KEY, document_name, page_number, ordinal,
//!        text, hash, embedding BLOB, indexed_at)
//! ```
//!
//! Vectors are stored as little-endian `f32` BLOBs and searched exactly by
//! brute-force cosine similarity. Distance is `1 - similarity`.
//!
//! A handle opened on a task that was never indexed is *empty*: it answers
//! every query with no results and never touches the filesystem.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::RetrievalError;
use crate::models::{Candidate, IndexedChunk};

/// File name of the index inside a task's index directory.
pub const INDEX_FILE: &str = "index.sqlite";

pub struct VectorIndex {
    task: String,
    pool: Option<SqlitePool>,
}

impl VectorIndex {
    /// Open the index in `dir`, creating the directory, file and schema if
    /// absent. Idempotent.
    pub async fn open_or_create(task: &str, dir: &Path) -> Result<Self, RetrievalError> {
        std::fs::create_dir_all(dir).map_err(|e| RetrievalError::index_access(task, e))?;

        let options = SqliteConnectOptions::new()
            .filename(dir.join(INDEX_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = connect(task, options).await?;
        migrate(task, &pool).await?;

        Ok(Self {
            task: task.to_string(),
            pool: Some(pool),
        })
    }

    /// Open the index in `dir` for querying. A missing index yields an
    /// empty handle instead of an error.
    pub async fn open_existing(task: &str, dir: &Path) -> Result<Self, RetrievalError> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            tracing::debug!(task, path = %path.display(), "no index on disk, using empty handle");
            return Ok(Self::empty(task));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false);
        let pool = connect(task, options).await?;

        Ok(Self {
            task: task.to_string(),
            pool: Some(pool),
        })
    }

    /// A handle that holds nothing and returns no results.
    pub fn empty(task: &str) -> Self {
        Self {
            task: task.to_string(),
            pool: None,
        }
    }

    fn err(&self, e: impl std::fmt::Display) -> RetrievalError {
        RetrievalError::index_access(&self.task, e)
    }

    /// Number of stored chunks.
    pub async fn count(&self) -> Result<usize, RetrievalError> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(pool)
            .await
            .map_err(|e| self.err(e))?;
        Ok(count as usize)
    }

    /// All stored chunk ids, sorted.
    pub async fn chunk_ids(&self) -> Result<Vec<String>, RetrievalError> {
        let Some(pool) = &self.pool else {
            return Ok(Vec::new());
        };
        sqlx::query_scalar("SELECT id FROM chunks ORDER BY id")
            .fetch_all(pool)
            .await
            .map_err(|e| self.err(e))
    }

    /// Embedding model recorded for this index.
    pub async fn model(&self) -> Result<Option<String>, RetrievalError> {
        self.meta("model").await
    }

    /// Vector dimensionality recorded for this index.
    pub async fn dims(&self) -> Result<Option<usize>, RetrievalError> {
        match self.meta("dims").await? {
            Some(value) => value
                .parse::<usize>()
                .map(Some)
                .map_err(|e| self.err(format!("corrupt dims metadata '{}': {}", value, e))),
            None => Ok(None),
        }
    }

    async fn meta(&self, key: &str) -> Result<Option<String>, RetrievalError> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };
        sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(|e| self.err(e))
    }

    /// Record the embedding model and dimensionality that produced the
    /// stored vectors.
    pub async fn set_model(&self, model: &str, dims: usize) -> Result<(), RetrievalError> {
        let pool = self.writable()?;
        let mut tx = pool.begin().await.map_err(|e| self.err(e))?;
        for (key, value) in [("model", model.to_string()), ("dims", dims.to_string())] {
            sqlx::query(
                "INSERT INTO index_meta (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.err(e))?;
        }
        tx.commit().await.map_err(|e| self.err(e))
    }

    /// Remove every chunk and all metadata.
    pub async fn clear(&self) -> Result<(), RetrievalError> {
        let pool = self.writable()?;
        let mut tx = pool.begin().await.map_err(|e| self.err(e))?;
        sqlx::query("DELETE FROM chunks")
            .execute(&mut *tx)
            .await
            .map_err(|e| self.err(e))?;
        sqlx::query("DELETE FROM index_meta")
            .execute(&mut *tx)
            .await
            .map_err(|e| self.err(e))?;
        tx.commit().await.map_err(|e| self.err(e))
    }

    /// Stored `id -> hash` for one document's chunks.
    pub async fn stored_hashes(
        &self,
        document_name: &str,
    ) -> Result<HashMap<String, String>, RetrievalError> {
        let Some(pool) = &self.pool else {
            return Ok(HashMap::new());
        };
        let rows = sqlx::query("SELECT id, hash FROM chunks WHERE document_name = ?")
            .bind(document_name)
            .fetch_all(pool)
            .await
            .map_err(|e| self.err(e))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(|e| self.err(e))?;
                let hash: String = row.try_get("hash").map_err(|e| self.err(e))?;
                Ok((id, hash))
            })
            .collect()
    }

    /// Delete a document's chunks whose ids are not in `keep`. Returns the
    /// number removed.
    pub async fn remove_stale(
        &self,
        document_name: &str,
        keep: &HashSet<String>,
    ) -> Result<usize, RetrievalError> {
        let stale: Vec<String> = self
            .stored_hashes(document_name)
            .await?
            .into_keys()
            .filter(|id| !keep.contains(id))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let pool = self.writable()?;
        let mut tx = pool.begin().await.map_err(|e| self.err(e))?;
        for id in &stale {
            sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.err(e))?;
        }
        tx.commit().await.map_err(|e| self.err(e))?;
        Ok(stale.len())
    }

    /// Insert or overwrite entries by chunk id, `batch_size` rows per
    /// transaction.
    ///
    /// Every vector must match the recorded dimensionality. If none is
    /// recorded yet, the first vector's length becomes the index's.
    pub async fn upsert(
        &self,
        entries: &[IndexedChunk],
        batch_size: usize,
    ) -> Result<(), RetrievalError> {
        if entries.is_empty() {
            return Ok(());
        }
        let pool = self.writable()?;

        let dims = match self.dims().await? {
            Some(dims) => dims,
            None => {
                let dims = entries[0].vector.len();
                sqlx::query("INSERT INTO index_meta (key, value) VALUES ('dims', ?)")
                    .bind(dims.to_string())
                    .execute(pool)
                    .await
                    .map_err(|e| self.err(e))?;
                dims
            }
        };
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != dims) {
            return Err(self.err(format!(
                "vector for chunk {} has dimension {}, index expects {}",
                bad.chunk.id,
                bad.vector.len(),
                dims
            )));
        }

        let now = chrono::Utc::now().timestamp();
        for batch in entries.chunks(batch_size.max(1)) {
            let mut tx = pool.begin().await.map_err(|e| self.err(e))?;
            for entry in batch {
                let chunk = &entry.chunk;
                sqlx::query(
                    r#"
                    INSERT INTO chunks
                        (id, document_name, page_number, ordinal, text, hash, embedding, indexed_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        document_name = excluded.document_name,
                        page_number = excluded.page_number,
                        ordinal = excluded.ordinal,
                        text = excluded.text,
                        hash = excluded.hash,
                        embedding = excluded.embedding,
                        indexed_at = excluded.indexed_at
                    "#,
                )
                .bind(&chunk.id)
                .bind(&chunk.document_name)
                .bind(chunk.page_number as i64)
                .bind(chunk.ordinal as i64)
                .bind(&chunk.text)
                .bind(&chunk.hash)
                .bind(vec_to_blob(&entry.vector))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.err(e))?;
            }
            tx.commit().await.map_err(|e| self.err(e))?;
        }
        Ok(())
    }

    /// The `k` nearest chunks to `vector`, closest first.
    ///
    /// Returns fewer than `k` results when the index holds fewer entries,
    /// and none for an empty handle. A query vector whose dimension differs
    /// from the index's fails with [`RetrievalError::IndexAccess`].
    pub async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        let Some(pool) = &self.pool else {
            return Ok(Vec::new());
        };
        let Some(dims) = self.dims().await? else {
            return Ok(Vec::new());
        };
        if vector.len() != dims {
            return Err(self.err(format!(
                "query vector has dimension {}, index expects {}",
                vector.len(),
                dims
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT id, document_name, page_number, text, embedding FROM chunks ORDER BY rowid",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| self.err(e))?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding").map_err(|e| self.err(e))?;
            let stored = blob_to_vec(&blob);
            if stored.len() != dims {
                return Err(self.err(format!(
                    "stored vector has dimension {}, index expects {}",
                    stored.len(),
                    dims
                )));
            }
            let page_number: i64 = row.try_get("page_number").map_err(|e| self.err(e))?;
            candidates.push(Candidate {
                chunk_id: row.try_get("id").map_err(|e| self.err(e))?,
                document_name: row.try_get("document_name").map_err(|e| self.err(e))?,
                page_number: page_number as u32,
                text: row.try_get("text").map_err(|e| self.err(e))?,
                distance: 1.0 - cosine_similarity(vector, &stored),
            });
        }

        // Stable sort keeps insertion order among equal distances.
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        candidates.truncate(k);
        Ok(candidates)
    }

    /// Close the underlying pool, flushing the WAL.
    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }

    fn writable(&self) -> Result<&SqlitePool, RetrievalError> {
        self.pool
            .as_ref()
            .ok_or_else(|| self.err("index is not open for writing"))
    }
}

async fn connect(task: &str, options: SqliteConnectOptions) -> Result<SqlitePool, RetrievalError> {
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| RetrievalError::index_access(task, e))
}

async fn migrate(task: &str, pool: &SqlitePool) -> Result<(), RetrievalError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_name TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            ordinal INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_name)",
    ];
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| RetrievalError::index_access(task, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_id, hash_text};
    use crate::models::Chunk;

    fn entry(doc: &str, page: u32, ordinal: u32, text: &str, vector: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            chunk: Chunk {
                id: chunk_id("t", doc, page, ordinal),
                document_name: doc.to_string(),
                page_number: page,
                ordinal,
                text: text.to_string(),
                hash: hash_text(text),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn missing_index_opens_as_empty_handle() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::open_existing("t", &dir.path().join("index"))
            .await
            .unwrap();
        assert_eq!(index.model().await.unwrap(), None);
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.query(&[1.0, 0.0], 5).await.unwrap().is_empty());
        assert!(!dir.path().join("index").exists());
    }

    #[tokio::test]
    async fn open_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::open_or_create("t", dir.path()).await.unwrap();
        index
            .upsert(&[entry("a.pdf", 1, 0, "alpha", vec![1.0, 0.0])], 10)
            .await
            .unwrap();
        index.close().await;

        let index = VectorIndex::open_or_create("t", dir.path()).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        index.close().await;
    }

    #[tokio::test]
    async fn query_orders_by_distance_and_handles_small_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::open_or_create("t", dir.path()).await.unwrap();
        index
            .upsert(
                &[
                    entry("a.pdf", 1, 0, "far", vec![0.0, 1.0]),
                    entry("a.pdf", 1, 1, "near", vec![1.0, 0.1]),
                    entry("a.pdf", 2, 0, "exact", vec![1.0, 0.0]),
                ],
                2,
            )
            .await
            .unwrap();

        let hits = index.query(&[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].text, "exact");
        assert_eq!(hits[0].page_number, 2);
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(hits[1].text, "near");
        assert_eq!(hits[2].text, "far");

        let top = index.query(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top.len(), 1);
        index.close().await;
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::open_or_create("t", dir.path()).await.unwrap();
        index
            .upsert(&[entry("a.pdf", 1, 0, "old", vec![1.0, 0.0])], 10)
            .await
            .unwrap();
        index
            .upsert(&[entry("a.pdf", 1, 0, "new", vec![0.0, 1.0])], 10)
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let hits = index.query(&[0.0, 1.0], 1).await.unwrap();
        assert_eq!(hits[0].text, "new");
        index.close().await;
    }

    #[tokio::test]
    async fn dimension_mismatch_is_index_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::open_or_create("task-x", dir.path()).await.unwrap();
        index
            .upsert(&[entry("a.pdf", 1, 0, "alpha", vec![1.0, 0.0, 0.0])], 10)
            .await
            .unwrap();

        let err = index.query(&[1.0, 0.0], 3).await.unwrap_err();
        assert!(
            matches!(&err, RetrievalError::IndexAccess { task, .. } if task == "task-x"),
            "{:?}",
            err
        );

        let err = index
            .upsert(&[entry("a.pdf", 1, 1, "beta", vec![1.0])], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::IndexAccess { .. }));
        index.close().await;
    }

    #[tokio::test]
    async fn remove_stale_only_touches_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::open_or_create("t", dir.path()).await.unwrap();
        index
            .upsert(
                &[
                    entry("a.pdf", 1, 0, "a0", vec![1.0, 0.0]),
                    entry("a.pdf", 1, 1, "a1", vec![1.0, 0.0]),
                    entry("b.pdf", 1, 0, "b0", vec![1.0, 0.0]),
                ],
                10,
            )
            .await
            .unwrap();

        let keep: HashSet<String> = [chunk_id("t", "a.pdf", 1, 0)].into_iter().collect();
        assert_eq!(index.remove_stale("a.pdf", &keep).await.unwrap(), 1);
        assert_eq!(index.count().await.unwrap(), 2);
        assert_eq!(index.stored_hashes("b.pdf").await.unwrap().len(), 1);
        index.close().await;
    }

    #[tokio::test]
    async fn model_metadata_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::open_or_create("t", dir.path()).await.unwrap();
        assert_eq!(index.model().await.unwrap(), None);
        index.set_model("hash-2", 2).await.unwrap();
        assert_eq!(index.model().await.unwrap().as_deref(), Some("hash-2"));
        assert_eq!(index.dims().await.unwrap(), Some(2));

        index
            .upsert(&[entry("a.pdf", 1, 0, "alpha", vec![1.0, 0.0])], 10)
            .await
            .unwrap();
        index.clear().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert_eq!(index.dims().await.unwrap(), None);
        index.close().await;
    }

    #[tokio::test]
    async fn separate_directories_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let one = VectorIndex::open_or_create("one", &dir.path().join("one"))
            .await
            .unwrap();
        let two = VectorIndex::open_or_create("two", &dir.path().join("two"))
            .await
            .unwrap();
        one.upsert(&[entry("a.pdf", 1, 0, "alpha", vec![1.0])], 10)
            .await
            .unwrap();
        assert_eq!(one.count().await.unwrap(), 1);
        assert_eq!(two.count().await.unwrap(), 0);
        one.close().await;
        two.close().await;
    }
}
