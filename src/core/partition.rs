//! # Partition Module / 分区模块
//!
//! Splits the globally sorted file list across the jobs of a distributed run.
//! Every job computes its own slice independently, so the split must be a pure
//! function of the sorted list, the job index and the job count.
//!
//! 在分布式运行的各个作业之间拆分全局排序的文件列表。
//! 每个作业独立计算自己的切片，因此拆分必须是排序列表、作业索引和作业总数的纯函数。

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// A caller-supplied total order over test files.
pub type FileComparator = Arc<dyn Fn(&Path, &Path) -> Ordering + Send + Sync>;

/// Identifies one job of a distributed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelRun {
    /// Zero-based index of this job.
    pub current_index: usize,
    /// Total number of jobs.
    pub total_runs: usize,
}

impl ParallelRun {
    pub fn new(current_index: usize, total_runs: usize) -> Result<Self, PartitionError> {
        let run = Self {
            current_index,
            total_runs,
        };
        run.validate()?;
        Ok(run)
    }

    pub fn validate(&self) -> Result<(), PartitionError> {
        if self.total_runs == 0 {
            return Err(PartitionError::ZeroRuns);
        }
        if self.current_index >= self.total_runs {
            return Err(PartitionError::IndexOutOfRange {
                index: self.current_index,
                total: self.total_runs,
            });
        }
        Ok(())
    }

    /// Reads the parallelism descriptor exposed by common CI providers.
    pub fn from_env() -> Result<Option<Self>, PartitionError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Same as [`ParallelRun::from_env`], with an injectable variable lookup.
    ///
    /// Recognized pairs, in priority order:
    /// - `CI_NODE_INDEX` / `CI_NODE_TOTAL` (1-based index)
    /// - `CIRCLE_NODE_INDEX` / `CIRCLE_NODE_TOTAL` (0-based)
    /// - `BUILDKITE_PARALLEL_JOB` / `BUILDKITE_PARALLEL_JOB_COUNT` (0-based)
    pub fn from_env_with<F>(lookup: F) -> Result<Option<Self>, PartitionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const PROVIDERS: [(&str, &str, bool); 3] = [
            ("CI_NODE_INDEX", "CI_NODE_TOTAL", true),
            ("CIRCLE_NODE_INDEX", "CIRCLE_NODE_TOTAL", false),
            ("BUILDKITE_PARALLEL_JOB", "BUILDKITE_PARALLEL_JOB_COUNT", false),
        ];

        for (index_var, total_var, one_based) in PROVIDERS {
            let (Some(index), Some(total)) = (lookup(index_var), lookup(total_var)) else {
                continue;
            };
            let index = parse_env_number(index_var, &index)?;
            let total = parse_env_number(total_var, &total)?;
            let index = if one_based {
                index.checked_sub(1).ok_or(PartitionError::InvalidEnv {
                    var: index_var,
                    value: "0".to_string(),
                })?
            } else {
                index
            };
            return Self::new(index, total).map(Some);
        }

        Ok(None)
    }
}

fn parse_env_number(var: &'static str, value: &str) -> Result<usize, PartitionError> {
    value
        .trim()
        .parse()
        .map_err(|_| PartitionError::InvalidEnv {
            var,
            value: value.to_string(),
        })
}

/// How a sorted list is divided among jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Balanced contiguous chunks. The first `len % total` jobs take one extra file.
    #[default]
    Contiguous,
    /// File `i` goes to job `i % total`.
    RoundRobin,
}

/// Errors produced while describing or reading a partition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("the total number of parallel runs must be at least 1")]
    ZeroRuns,
    #[error("parallel run index {index} is out of range for {total} total runs")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("environment variable {var} has an invalid value '{value}'")]
    InvalidEnv { var: &'static str, value: String },
}

/// Returns the slice of `items` assigned to `run`.
///
/// `items` must already be sorted with a total order; concatenating the results for
/// every index in `0..total_runs` yields each item exactly once.
pub fn split<T: Clone>(items: &[T], run: ParallelRun, strategy: PartitionStrategy) -> Vec<T> {
    let ParallelRun {
        current_index: index,
        total_runs: total,
    } = run;
    if total == 0 || index >= total {
        return Vec::new();
    }

    match strategy {
        PartitionStrategy::Contiguous => {
            let size = items.len() / total;
            let remainder = items.len() % total;
            let offset = index.min(remainder) + index * size;
            let chunk = size + usize::from(index < remainder);
            items[offset..offset + chunk].to_vec()
        }
        PartitionStrategy::RoundRobin => items
            .iter()
            .enumerate()
            .filter(|(i, _)| i % total == index)
            .map(|(_, item)| item.clone())
            .collect(),
    }
}

/// Sorts files with `comparator`, or with [`natural_path_cmp`] when none is given.
pub fn sort_files(files: &mut [PathBuf], comparator: Option<&FileComparator>) {
    match comparator {
        Some(comparator) => files.sort_by(|a, b| comparator(a, b)),
        None => files.sort_by(|a, b| natural_path_cmp(a, b)),
    }
}

pub fn natural_path_cmp(a: &Path, b: &Path) -> Ordering {
    natural_cmp(&a.to_string_lossy(), &b.to_string_lossy())
}

/// Numeric-aware lexical comparison: `file2` sorts before `file10`.
///
/// Digit runs compare by value, then by length (so `01` follows `1`); other runs
/// compare by code point. Ties fall back to plain string order, which keeps this a
/// total order consistent with equality.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = Chunks(a);
    let mut right = Chunks(b);

    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ordering = compare_chunks(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

fn compare_chunks(left: &str, right: &str) -> Ordering {
    let is_number = |s: &str| s.as_bytes()[0].is_ascii_digit();
    if is_number(left) && is_number(right) {
        let l = left.trim_start_matches('0');
        let r = right.trim_start_matches('0');
        l.len()
            .cmp(&r.len())
            .then_with(|| l.cmp(r))
            .then_with(|| left.len().cmp(&right.len()))
    } else {
        left.cmp(right)
    }
}

/// Splits a string into maximal runs of ASCII digits and non-digits.
struct Chunks<'a>(&'a str);

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let first = self.0.chars().next()?;
        let digits = first.is_ascii_digit();
        let end = self
            .0
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != digits)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        let (chunk, rest) = self.0.split_at(end);
        self.0 = rest;
        Some(chunk)
    }
}
