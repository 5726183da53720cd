//! # File System Operations Module / 文件系统操作模块
//!
//! Finds test files on disk. Candidates are the files under the configured roots
//! whose extension matches; paths containing an ignore substring are skipped.
//! Command-line patterns then narrow the candidates: a pattern naming an existing
//! file selects that file directly, any other pattern is a path substring filter.
//!
//! 在磁盘上查找测试文件。候选文件是配置根目录下扩展名匹配的文件；包含忽略子串的路径会被跳过。
//! 命令行模式会进一步缩小候选范围：指向现有文件的模式直接选中该文件，其他模式作为路径子串过滤器。

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::core::config::FilesConfig;
use crate::core::models::SelectionInsights;
use crate::core::orchestrator::{FileSelector, Selection};

/// Selects test files by walking directories.
#[derive(Debug, Clone)]
pub struct DirectorySelector {
    project_root: PathBuf,
    files: FilesConfig,
    patterns: Vec<String>,
}

impl DirectorySelector {
    pub fn new(project_root: impl Into<PathBuf>, files: FilesConfig, patterns: Vec<String>) -> Self {
        Self {
            project_root: project_root.into(),
            files,
            patterns,
        }
    }

    fn has_test_extension(&self, path: &Path) -> bool {
        if self.files.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.files.extensions.iter().any(|wanted| wanted == ext))
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.files.ignore.iter().any(|needle| path.contains(needle.as_str()))
    }

    /// Collects candidate files under every root. Returns the candidates and how many were ignored.
    fn candidates(&self) -> Result<(BTreeSet<PathBuf>, usize)> {
        let mut found = Vec::new();
        for root in &self.files.roots {
            let root = self.project_root.join(root);
            if root.is_file() {
                found.push(root);
            } else if is_directory(&root) {
                walk(&root, &mut found)?;
            } else {
                debug!(root = %root.display(), "test root does not exist");
            }
        }

        let mut ignored = 0;
        let mut candidates = BTreeSet::new();
        for path in found {
            if !self.has_test_extension(&path) {
                continue;
            }
            if self.is_ignored(&path) {
                ignored += 1;
                continue;
            }
            candidates.insert(path);
        }
        Ok((candidates, ignored))
    }
}

impl FileSelector for DirectorySelector {
    fn select(&self) -> Result<Selection> {
        let (candidates, ignored_files) = self.candidates()?;
        let test_file_count = candidates.len();

        let files: BTreeSet<PathBuf> = if self.patterns.is_empty() {
            candidates
        } else {
            let mut direct = BTreeSet::new();
            let mut filters = Vec::new();
            for pattern in &self.patterns {
                let path = self.project_root.join(pattern);
                if path.is_file() {
                    direct.insert(path);
                } else {
                    filters.push(pattern.as_str());
                }
            }

            let mut selected: BTreeSet<PathBuf> = candidates
                .into_iter()
                .filter(|file| {
                    let relative = file.strip_prefix(&self.project_root).unwrap_or(file);
                    let relative = relative.to_string_lossy();
                    filters.iter().any(|filter| relative.contains(filter))
                })
                .collect();
            selected.extend(direct);
            selected
        };

        debug!(
            candidates = test_file_count,
            selected = files.len(),
            ignored_files,
            "selected test files"
        );

        Ok(Selection {
            insights: SelectionInsights {
                filter: self.patterns.clone(),
                ignored_files,
                test_file_count,
                selection_count: files.len(),
            },
            files: files.into_iter().collect(),
        })
    }
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    // Hidden entries below the root are skipped, hidden directories with their contents.
    let entries = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", dir.display()))?;
        if !entry.file_type().is_dir() {
            found.push(entry.into_path());
        }
    }
    Ok(())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Checks if a path exists and is a directory.
pub fn is_directory(path: &Path) -> bool {
    path.exists() && path.is_dir()
}

/// Gets the absolute path from a potentially relative path.
///
/// # Arguments
/// * `path` - Path to canonicalize
///
/// # Returns
/// Canonicalized absolute path, or an error if the path doesn't exist
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("Failed to resolve path: {}", path.display()))
}
