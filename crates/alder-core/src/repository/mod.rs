//! Versioned repository adapters.
//!
//! An adapter supplies ordered commit deltas and materialises file contents
//! for a revision. The engine never touches version control directly.

mod local;

pub use local::LocalDirectoryAdapter;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown revision '{0}'")]
    UnknownRevision(String),

    #[error("path '{path}' not found at revision {revision}")]
    PathNotFound { revision: String, path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct CommitItem {
    /// Repository-relative path, `/`-separated.
    pub path: String,
    pub change: ChangeType,
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub revision: String,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub items: Vec<CommitItem>,
}

#[async_trait]
pub trait RepositoryAdapter: Send + Sync {
    /// Stable URL identifying this repository in the graph.
    fn url(&self) -> &str;

    async fn first_revision(&self) -> Result<Option<String>, RepositoryError>;

    async fn current_revision(&self) -> Result<String, RepositoryError>;

    /// Ordered commits after `from` (exclusive) up to `to` (inclusive);
    /// `None` asks for the full history. Each commit's item order is
    /// preserved by the engine.
    async fn delta(&self, from: Option<&str>, to: &str) -> Result<Vec<Commit>, RepositoryError>;

    /// Materialises `path` at `revision`, staging under `destination` when
    /// the adapter cannot hand out a direct path. Returns the readable file.
    async fn import_file(
        &self,
        revision: &str,
        path: &str,
        destination: &Path,
    ) -> Result<PathBuf, RepositoryError>;
}
