//! On-disk task store.
//!
//! ```text
//! <root>/<task>/
//!   bulk/                  reference documents, indexed
//!   fresh/                 the document being read
//!   index/                 vector index (opaque to this module)
//!   status.txt             processing | ready | failed
//!   created_at.txt         RFC 3339 timestamp
//!   recommendations.json   last query result
//! ```
//!
//! Task and file names are reduced to their final path component, so a
//! name can never escape the store root.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::error::RetrievalError;
use crate::models::RankedResult;
use crate::retrieve::IndexLocator;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task name: '{0}'")]
    InvalidName(String),

    #[error("invalid file name: '{0}'")]
    InvalidFileName(String),

    #[error("task '{0}' already exists")]
    AlreadyExists(String),

    #[error("task '{0}' not found")]
    NotFound(String),

    #[error("document '{file}' not found in task '{task}'")]
    DocumentNotFound { task: String, file: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TaskError + '_ {
    move |source| TaskError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Processing,
    Ready,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Ready => "ready",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s.trim() {
            "ready" => TaskStatus::Ready,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Processing,
        }
    }
}

/// Which side of a task a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentSlot {
    Bulk,
    Fresh,
}

impl DocumentSlot {
    fn dir_name(self) -> &'static str {
        match self {
            DocumentSlot::Bulk => "bulk",
            DocumentSlot::Fresh => "fresh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub task_name: String,
    pub bulk_files: Vec<String>,
    pub fresh_files: Vec<String>,
    pub status: TaskStatus,
    pub created_at: Option<String>,
}

/// Keep only the final path component of `name`; reject empty, `.` and `..`.
pub fn sanitize_name(name: &str) -> Option<String> {
    let last = name
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();
    match last {
        "" | "." | ".." => None,
        other => Some(other.to_string()),
    }
}

pub fn sanitize_task_name(name: &str) -> Result<String, TaskError> {
    sanitize_name(name).ok_or_else(|| TaskError::InvalidName(name.to_string()))
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, name: &str) -> Result<PathBuf, TaskError> {
        Ok(self.root.join(sanitize_task_name(name)?))
    }

    pub fn exists(&self, name: &str) -> Result<bool, TaskError> {
        Ok(self.task_dir(name)?.is_dir())
    }

    fn existing_task_dir(&self, name: &str) -> Result<PathBuf, TaskError> {
        let dir = self.task_dir(name)?;
        if !dir.is_dir() {
            return Err(TaskError::NotFound(sanitize_task_name(name)?));
        }
        Ok(dir)
    }

    /// Create the task layout. Fails if the task already exists.
    /// Returns the sanitized task name.
    pub fn create(&self, name: &str) -> Result<String, TaskError> {
        let task = sanitize_task_name(name)?;
        let dir = self.root.join(&task);
        if dir.exists() {
            return Err(TaskError::AlreadyExists(task));
        }
        for slot in [DocumentSlot::Bulk, DocumentSlot::Fresh] {
            let sub = dir.join(slot.dir_name());
            std::fs::create_dir_all(&sub).map_err(io_err(&sub))?;
        }
        let created = dir.join("created_at.txt");
        std::fs::write(&created, chrono::Utc::now().to_rfc3339()).map_err(io_err(&created))?;
        self.set_status(&task, TaskStatus::Processing)?;
        tracing::debug!(task = %task, "task created");
        Ok(task)
    }

    pub fn set_status(&self, name: &str, status: TaskStatus) -> Result<(), TaskError> {
        let path = self.existing_task_dir(name)?.join("status.txt");
        std::fs::write(&path, status.as_str()).map_err(io_err(&path))
    }

    /// Store an uploaded document under its sanitized file name.
    pub fn save_document(
        &self,
        name: &str,
        slot: DocumentSlot,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, TaskError> {
        let file = sanitize_name(file_name)
            .ok_or_else(|| TaskError::InvalidFileName(file_name.to_string()))?;
        let dir = self.existing_task_dir(name)?.join(slot.dir_name());
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join(file);
        std::fs::write(&path, bytes).map_err(io_err(&path))?;
        Ok(path)
    }

    /// Bulk documents of a task, ordered by file name.
    pub fn bulk_documents(&self, name: &str) -> Result<Vec<PathBuf>, TaskError> {
        let dir = self.existing_task_dir(name)?.join(DocumentSlot::Bulk.dir_name());
        list_files(&dir)
    }

    /// Locate a document by file name, preferring the fresh side.
    pub fn resolve_document(&self, name: &str, file_name: &str) -> Result<PathBuf, TaskError> {
        let task = sanitize_task_name(name)?;
        let not_found = || TaskError::DocumentNotFound {
            task: task.clone(),
            file: file_name.to_string(),
        };
        let file = sanitize_name(file_name).ok_or_else(not_found)?;
        let dir = self.root.join(&task);
        [DocumentSlot::Fresh, DocumentSlot::Bulk]
            .iter()
            .map(|slot| dir.join(slot.dir_name()).join(&file))
            .find(|path| path.is_file())
            .ok_or_else(not_found)
    }

    /// All tasks, ordered by name.
    pub fn list(&self) -> Result<Vec<TaskSummary>, TaskError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| TaskError::Io {
                path: self.root.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            let task_name = entry.file_name().to_string_lossy().to_string();
            let status = std::fs::read_to_string(dir.join("status.txt"))
                .map(|s| TaskStatus::parse(&s))
                .unwrap_or(TaskStatus::Processing);
            let created_at = std::fs::read_to_string(dir.join("created_at.txt"))
                .ok()
                .map(|s| s.trim().to_string());

            tasks.push(TaskSummary {
                task_name,
                bulk_files: file_names(&dir.join(DocumentSlot::Bulk.dir_name()))?,
                fresh_files: file_names(&dir.join(DocumentSlot::Fresh.dir_name()))?,
                status,
                created_at,
            });
        }
        Ok(tasks)
    }

    /// Persist the latest recommendations next to the task.
    pub fn save_recommendations(
        &self,
        name: &str,
        results: &[RankedResult],
    ) -> Result<(), TaskError> {
        let path = self.existing_task_dir(name)?.join("recommendations.json");
        let json = serde_json::to_string_pretty(results).map_err(|e| TaskError::Io {
            path: path.clone(),
            source: e.into(),
        })?;
        std::fs::write(&path, json).map_err(io_err(&path))
    }
}

impl IndexLocator for TaskStore {
    fn index_dir(&self, task_id: &str) -> Result<PathBuf, RetrievalError> {
        self.task_dir(task_id)
            .map(|dir| dir.join("index"))
            .map_err(|_| RetrievalError::InvalidTaskName(task_id.to_string()))
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, TaskError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| TaskError::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn file_names(dir: &Path) -> Result<Vec<String>, TaskError> {
    Ok(list_files(dir)?
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect())
}
