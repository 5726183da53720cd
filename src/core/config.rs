//! # Configuration Module / 配置模块
//!
//! Loads the run configuration from a TOML file (`Runner.toml` by default).
//!
//! 从 TOML 文件（默认为 `Runner.toml`）加载运行配置。

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::partition::{ParallelRun, PartitionStrategy};

/// Default idle timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// How the selected files are ordered before partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    /// Numeric-aware lexical order (`a2` before `a10`).
    Numeric,
    /// Plain code point order.
    Lexical,
}

/// Settings for the debug mode, where exactly one file runs with a debugger attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Interpreter arguments appended in debug mode (e.g. `--inspect-brk=127.0.0.1:9229`).
    #[serde(default)]
    pub args: Vec<String>,
}

/// Where test files are looked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Directories (or files) relative to the project root.
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    /// File extensions, without the dot. Empty means any extension.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Substrings; a candidate path containing any of them is ignored.
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            extensions: Vec::new(),
            ignore: Vec::new(),
        }
    }
}

/// How a worker process is started for each test file.
/// 如何为每个测试文件启动 worker 进程。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Command template. `{file}` is replaced by the test file; when absent the
    /// file is appended as the last argument. Environment variables are expanded.
    #[serde(default)]
    pub command: String,
    /// Interpreter-level arguments, inserted right after the program.
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// Extra environment variables for every worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The complete run configuration.
///
/// 完整的运行配置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// The language for the runner's output messages (e.g., "en", "zh-CN").
    /// 运行器输出消息的语言（例如 "en", "zh-CN"）。
    #[serde(default = "default_language")]
    pub language: String,
    /// Maximum number of concurrently running workers. Resolved from the host when absent.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Run one file at a time.
    #[serde(default)]
    pub serial: bool,
    /// Stop launching new files after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Idle timeout in milliseconds. `0` disables the watchdog.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Debug mode. Present means enabled.
    #[serde(default)]
    pub debug: Option<DebugConfig>,
    #[serde(default)]
    pub parallel: Option<ParallelRun>,
    #[serde(default)]
    pub partition: PartitionStrategy,
    /// Explicit ordering. Distributed runs always sort, numerically by default.
    #[serde(default)]
    pub sort: Option<SortOrder>,
    /// Whether the failure cache is read and written.
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Failure cache directory, relative to the project root.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            concurrency: None,
            serial: false,
            fail_fast: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            debug: None,
            parallel: None,
            partition: PartitionStrategy::default(),
            sort: None,
            cache: true,
            cache_dir: default_cache_dir(),
            files: FilesConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl RunConfig {
    /// The idle timeout, or `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn is_debug(&self) -> bool {
        self.debug.is_some()
    }

    /// Checks settings that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.worker.command.trim().is_empty() {
            bail!("No worker command configured. Set `[worker] command` or pass --command.");
        }
        if self.concurrency == Some(0) {
            bail!("`concurrency` must be at least 1.");
        }
        if let Some(parallel) = &self.parallel {
            parallel.validate().context("Invalid `[parallel]` settings")?;
        }
        Ok(())
    }
}

/// Reads and parses a configuration file.
pub fn load_run_config(path: &Path) -> Result<RunConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_language() -> String {
    "en".to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache/isorun")
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("tests")]
}
