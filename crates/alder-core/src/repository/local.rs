//! Local-directory repository adapter.
//!
//! Revisions are a monotonic scan counter: every call to
//! [`current_revision`](RepositoryAdapter::current_revision) rescans the
//! tree and bumps the counter if anything changed. Per-file created/changed
//! revisions and deletion tombstones are kept so a delta that was not fully
//! consumed (a retried cycle) can be served again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;
use ignore::WalkBuilder;
use tracing::debug;

use super::{ChangeType, Commit, CommitItem, RepositoryAdapter, RepositoryError};

pub struct LocalDirectoryAdapter {
    root: PathBuf,
    url: String,
    /// File name suffixes to track; empty tracks everything.
    extensions: Vec<String>,
    state: Mutex<ScanState>,
}

#[derive(Default)]
struct ScanState {
    revision: u64,
    files: BTreeMap<String, FileState>,
}

struct FileState {
    modified: SystemTime,
    len: u64,
    created_rev: u64,
    changed_rev: u64,
    deleted: bool,
}

impl LocalDirectoryAdapter {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|source| RepositoryError::Io {
                path: root.as_ref().to_path_buf(),
                source,
            })?;
        let url = format!("file://{}", root.display());
        Ok(Self {
            root,
            url,
            extensions: Vec::new(),
            state: Mutex::new(ScanState::default()),
        })
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracked(&self, path: &str) -> bool {
        self.extensions.is_empty() || self.extensions.iter().any(|ext| path.ends_with(ext))
    }

    /// Rescans the tree, advancing the revision counter once if anything
    /// was added, modified or removed.
    fn scan(&self) -> Result<(), RepositoryError> {
        let mut current: BTreeMap<String, (SystemTime, u64)> = BTreeMap::new();
        for entry in WalkBuilder::new(&self.root).build() {
            let entry = entry.map_err(|err| RepositoryError::Unavailable(err.to_string()))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let path = relative.to_string_lossy().into_owned();
            if !self.tracked(&path) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|err| RepositoryError::Unavailable(err.to_string()))?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            current.insert(path, (modified, metadata.len()));
        }

        let mut state = self.lock();
        let mut changed = false;
        for (path, (modified, len)) in &current {
            match state.files.get(path) {
                Some(existing)
                    if !existing.deleted && existing.modified == *modified && existing.len == *len => {}
                _ => {
                    changed = true;
                    break;
                }
            }
        }
        if !changed {
            changed = state
                .files
                .iter()
                .any(|(path, fs)| !fs.deleted && !current.contains_key(path));
        }
        if !changed {
            return Ok(());
        }

        state.revision += 1;
        let revision = state.revision;
        for (path, (modified, len)) in current.iter() {
            match state.files.get_mut(path) {
                Some(existing) if existing.deleted => {
                    existing.modified = *modified;
                    existing.len = *len;
                    existing.created_rev = revision;
                    existing.changed_rev = revision;
                    existing.deleted = false;
                }
                Some(existing) => {
                    if existing.modified != *modified || existing.len != *len {
                        existing.modified = *modified;
                        existing.len = *len;
                        existing.changed_rev = revision;
                    }
                }
                None => {
                    state.files.insert(
                        path.clone(),
                        FileState {
                            modified: *modified,
                            len: *len,
                            created_rev: revision,
                            changed_rev: revision,
                            deleted: false,
                        },
                    );
                }
            }
        }
        for (path, fs) in state.files.iter_mut() {
            if !fs.deleted && !current.contains_key(path) {
                fs.deleted = true;
                fs.changed_rev = revision;
            }
        }
        debug!(url = %self.url, revision, "directory scan observed changes");
        Ok(())
    }
}

fn parse_revision(text: &str) -> Result<u64, RepositoryError> {
    text.parse()
        .map_err(|_| RepositoryError::UnknownRevision(text.to_string()))
}

#[async_trait]
impl RepositoryAdapter for LocalDirectoryAdapter {
    fn url(&self) -> &str {
        &self.url
    }

    async fn first_revision(&self) -> Result<Option<String>, RepositoryError> {
        Ok(Some("0".to_string()))
    }

    async fn current_revision(&self) -> Result<String, RepositoryError> {
        self.scan()?;
        Ok(self.lock().revision.to_string())
    }

    async fn delta(&self, from: Option<&str>, to: &str) -> Result<Vec<Commit>, RepositoryError> {
        let from_rev = match from {
            Some(text) => parse_revision(text)?,
            None => 0,
        };
        let to_rev = parse_revision(to)?;

        let state = self.lock();
        let mut deletions = Vec::new();
        let mut additions = Vec::new();
        for (path, fs) in state.files.iter() {
            if fs.changed_rev <= from_rev || fs.changed_rev > to_rev {
                continue;
            }
            if fs.deleted {
                // A file created and deleted inside the window never
                // existed for this consumer.
                if fs.created_rev <= from_rev {
                    deletions.push(CommitItem {
                        path: path.clone(),
                        change: ChangeType::Deleted,
                    });
                }
            } else if fs.created_rev > from_rev {
                additions.push(CommitItem {
                    path: path.clone(),
                    change: ChangeType::Added,
                });
            } else {
                additions.push(CommitItem {
                    path: path.clone(),
                    change: ChangeType::Updated,
                });
            }
        }

        let mut items = deletions;
        items.extend(additions);
        if items.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Commit {
            revision: to_rev.to_string(),
            author: "local".to_string(),
            message: "filesystem scan".to_string(),
            timestamp: Utc::now(),
            items,
        }])
    }

    async fn import_file(
        &self,
        revision: &str,
        path: &str,
        _destination: &Path,
    ) -> Result<PathBuf, RepositoryError> {
        // Local files are read in place; no staging copy.
        let full = self.root.join(path);
        if !full.is_file() {
            return Err(RepositoryError::PathNotFound {
                revision: revision.to_string(),
                path: path.to_string(),
            });
        }
        Ok(full)
    }
}
