//! # Failure Cache Module / 失败缓存模块
//!
//! Remembers which test files failed in the previous run of a project, so the
//! next run can schedule them first for faster feedback. The cache is advisory:
//! a missing, unreadable or corrupt cache file means "no known failures" and a
//! failed write never fails the run.
//!
//! 记住项目上一次运行中哪些测试文件失败了，以便下一次运行优先调度它们以获得更快的反馈。
//! 缓存只是建议性的：缺失、不可读或损坏的缓存文件意味着"没有已知失败"，写入失败也不会导致运行失败。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::models::RunSummary;

/// Name of the cache file inside the cache directory.
pub const CACHE_FILE_NAME: &str = "failing-test-files.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    projects: BTreeMap<String, ProjectEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectEntry {
    updated_at: DateTime<Utc>,
    failing_files: Vec<PathBuf>,
}

/// Errors that can occur while reading or writing the cache file.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache file at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
    #[error("failed to parse cache file at {}", path.display())]
    Deserialize {
        path: PathBuf,
        #[source]
        error: serde_json::Error,
    },
    #[error("cache file at {} has version {actual}, expected {expected}", path.display())]
    VersionMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },
    #[error("failed to serialize cache document")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write cache file at {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
}

/// Per-project record of previously failing test files.
///
/// 每个项目之前失败的测试文件记录。
#[derive(Debug, Clone)]
pub struct FailureCache {
    path: PathBuf,
    project: String,
}

impl FailureCache {
    const CURRENT_VERSION: u32 = 1;

    /// Creates a cache stored in `cache_dir`, keyed by `project_root`.
    pub fn new(cache_dir: &Path, project_root: &Path) -> Self {
        Self {
            path: cache_dir.join(CACHE_FILE_NAME),
            project: project_root.to_string_lossy().into_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the failing files recorded for this project, if any.
    pub fn load(&self) -> Result<Option<Vec<PathBuf>>, CacheError> {
        Ok(self
            .load_document()?
            .and_then(|mut document| document.projects.remove(&self.project))
            .map(|entry| entry.failing_files))
    }

    fn load_document(&self) -> Result<Option<CacheDocument>, CacheError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(CacheError::Read {
                    path: self.path.clone(),
                    error,
                });
            }
        };

        let document: CacheDocument =
            serde_json::from_str(&contents).map_err(|error| CacheError::Deserialize {
                path: self.path.clone(),
                error,
            })?;

        if document.version != Self::CURRENT_VERSION {
            return Err(CacheError::VersionMismatch {
                path: self.path.clone(),
                expected: Self::CURRENT_VERSION,
                actual: document.version,
            });
        }

        Ok(Some(document))
    }

    /// The previously failing files, treating any cache problem as "none".
    pub fn previous_failures(&self) -> Vec<PathBuf> {
        match self.load() {
            Ok(files) => files.unwrap_or_default(),
            Err(error) => {
                warn!(%error, "ignoring unreadable failure cache");
                Vec::new()
            }
        }
    }

    /// Moves previously failing files to the front, keeping relative order otherwise.
    ///
    /// Returns `files` unchanged when `enabled` is false or nothing is cached.
    pub fn reorder(&self, files: Vec<PathBuf>, enabled: bool) -> Vec<PathBuf> {
        if !enabled {
            return files;
        }

        let failing: BTreeSet<PathBuf> = self.previous_failures().into_iter().collect();
        if failing.is_empty() {
            return files;
        }

        let (mut first, rest): (Vec<_>, Vec<_>) =
            files.into_iter().partition(|file| failing.contains(file));
        debug!(count = first.len(), "scheduling previously failing files first");
        first.extend(rest);
        first
    }

    /// Records this run's failing files and returns the files whose cached state changed.
    ///
    /// Returns `None` when caching is disabled. A write failure is logged and reported
    /// as "nothing changed".
    pub fn persist(&self, summary: &RunSummary, enabled: bool) -> Option<Vec<PathBuf>> {
        if !enabled {
            return None;
        }

        let mut document = match self.load_document() {
            Ok(document) => document.unwrap_or_default(),
            Err(error) => {
                warn!(%error, "overwriting unreadable failure cache");
                CacheDocument::default()
            }
        };
        document.version = Self::CURRENT_VERSION;

        let previous: BTreeSet<PathBuf> = document
            .projects
            .get(&self.project)
            .map(|entry| entry.failing_files.iter().cloned().collect())
            .unwrap_or_default();
        let current = summary.failing_files();

        let changed: Vec<PathBuf> = previous.symmetric_difference(&current).cloned().collect();
        if changed.is_empty() {
            return Some(changed);
        }

        document.projects.insert(
            self.project.clone(),
            ProjectEntry {
                updated_at: Utc::now(),
                failing_files: current.into_iter().collect(),
            },
        );

        match self.save(&document) {
            Ok(()) => Some(changed),
            Err(error) => {
                warn!(%error, "failed to update failure cache");
                Some(Vec::new())
            }
        }
    }

    fn save(&self, document: &CacheDocument) -> Result<(), CacheError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let write_error = |error| CacheError::Write {
            path: self.path.clone(),
            error,
        };

        fs::create_dir_all(dir).map_err(write_error)?;
        let contents = serde_json::to_vec_pretty(document).map_err(CacheError::Serialize)?;

        // Readers never see a partial file: write a sibling temp file, then rename.
        let mut file = NamedTempFile::new_in(dir).map_err(write_error)?;
        file.write_all(&contents).map_err(write_error)?;
        file.persist(&self.path)
            .map_err(|error| write_error(error.error))?;
        Ok(())
    }
}
