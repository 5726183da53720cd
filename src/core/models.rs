//! # Data Models Module / 数据模型模块
//!
//! This module defines the event and statistics types that flow from workers,
//! through the run status aggregator, to reporters.
//!
//! 此模块定义了从 worker 经由运行状态聚合器流向报告器的事件和统计类型。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Tests that were still running when a timeout or interrupt happened, grouped by file.
pub type PendingTests = BTreeMap<PathBuf, BTreeSet<String>>;

/// A single state change in the life of a run.
///
/// Worker-originated variants arrive in the order the worker produced them. The
/// remaining variants are synthesized by the orchestrator or the status aggregator.
///
/// 运行生命周期中的单个状态变化。
/// 来自 worker 的变体按 worker 产生的顺序到达；其余变体由编排器或状态聚合器合成。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StateChange {
    DeclaredTest {
        title: String,
        known_failing: bool,
    },
    SelectedTest {
        title: String,
        skip: bool,
        todo: bool,
    },
    TestPassed {
        title: String,
        duration_ms: u64,
        known_failing: bool,
    },
    TestFailed {
        title: String,
        duration_ms: u64,
        message: Option<String>,
    },
    HookFailed {
        title: String,
        message: Option<String>,
    },
    UncaughtException {
        message: String,
    },
    UnhandledRejection {
        message: String,
    },
    /// A test declared a per-test timeout longer than the run's idle timeout.
    TestTimeoutConfigured {
        period_ms: u64,
    },
    WorkerStdout {
        chunk: String,
    },
    WorkerStderr {
        chunk: String,
    },
    WorkerFinished {
        forced_exit: bool,
    },
    WorkerFailed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        message: Option<String>,
    },
    /// The idle watchdog fired. `pending_tests` is filled in by the status aggregator.
    Timeout {
        period_ms: u64,
        pending_tests: PendingTests,
    },
    Interrupt {
        pending_tests: PendingTests,
    },
    InternalError {
        message: String,
    },
    /// Files whose cached failure state changed in this run.
    TouchedFiles {
        files: Vec<PathBuf>,
    },
    /// Final statistics snapshot, emitted once when the run ends.
    Stats {
        stats: Box<Stats>,
    },
}

impl StateChange {
    /// Raw process output passthrough. It never counts as test activity.
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            StateChange::WorkerStdout { .. } | StateChange::WorkerStderr { .. }
        )
    }

    /// Events that stop admission of new work under fail-fast.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StateChange::HookFailed { .. }
                | StateChange::TestFailed { .. }
                | StateChange::WorkerFailed { .. }
        )
    }

    /// Events marking the end of a worker's life.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateChange::WorkerFinished { .. } | StateChange::WorkerFailed { .. }
        )
    }
}

/// A state change tagged with the test file it originated from, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub test_file: Option<PathBuf>,
    pub change: StateChange,
}

impl StatusEvent {
    /// A run-level event that belongs to no particular file.
    pub fn run_level(change: StateChange) -> Self {
        Self {
            test_file: None,
            change,
        }
    }

    pub fn for_file(file: impl Into<PathBuf>, change: StateChange) -> Self {
        Self {
            test_file: Some(file.into()),
            change,
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.test_file.as_deref()
    }
}

/// Messages a worker process may report over the stdout event protocol.
///
/// Only a subset of [`StateChange`]: workers cannot inject
/// run-level events such as `timeout` or `stats`.
///
/// worker 进程可以通过 stdout 事件协议报告的消息。
/// 这是 [`StateChange`] 的子集：worker 不能注入诸如 `timeout` 或 `stats` 的运行级事件。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    DeclaredTest {
        title: String,
        #[serde(default)]
        known_failing: bool,
    },
    SelectedTest {
        title: String,
        #[serde(default)]
        skip: bool,
        #[serde(default)]
        todo: bool,
    },
    TestPassed {
        title: String,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        known_failing: bool,
    },
    TestFailed {
        title: String,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        message: Option<String>,
    },
    HookFailed {
        title: String,
        #[serde(default)]
        message: Option<String>,
    },
    UncaughtException {
        message: String,
    },
    UnhandledRejection {
        message: String,
    },
    TestTimeoutConfigured {
        period_ms: u64,
    },
}

impl From<WorkerMessage> for StateChange {
    fn from(message: WorkerMessage) -> Self {
        match message {
            WorkerMessage::DeclaredTest {
                title,
                known_failing,
            } => StateChange::DeclaredTest {
                title,
                known_failing,
            },
            WorkerMessage::SelectedTest { title, skip, todo } => {
                StateChange::SelectedTest { title, skip, todo }
            }
            WorkerMessage::TestPassed {
                title,
                duration_ms,
                known_failing,
            } => StateChange::TestPassed {
                title,
                duration_ms,
                known_failing,
            },
            WorkerMessage::TestFailed {
                title,
                duration_ms,
                message,
            } => StateChange::TestFailed {
                title,
                duration_ms,
                message,
            },
            WorkerMessage::HookFailed { title, message } => {
                StateChange::HookFailed { title, message }
            }
            WorkerMessage::UncaughtException { message } => {
                StateChange::UncaughtException { message }
            }
            WorkerMessage::UnhandledRejection { message } => {
                StateChange::UnhandledRejection { message }
            }
            WorkerMessage::TestTimeoutConfigured { period_ms } => {
                StateChange::TestTimeoutConfigured { period_ms }
            }
        }
    }
}

/// Counters for a single test file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    /// Order in which the file's worker was launched, starting at 0.
    pub launch_index: usize,
    pub declared_tests: usize,
    pub selected_tests: usize,
    pub passed_tests: usize,
    pub passed_known_failing_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    pub todo_tests: usize,
    pub failed_hooks: usize,
    pub uncaught_exceptions: usize,
    pub unhandled_rejections: usize,
    pub internal_errors: usize,
}

impl FileStats {
    pub fn new(launch_index: usize) -> Self {
        Self {
            launch_index,
            ..Self::default()
        }
    }

    /// A file "failed" for caching purposes when a test or a hook failed in it.
    pub fn has_failures(&self) -> bool {
        self.failed_tests > 0 || self.failed_hooks > 0
    }
}

/// Running statistics for a whole run. Every counter only ever increases.
///
/// 整个运行的统计信息。每个计数器只会增加。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Number of test files selected before partitioning.
    pub files: usize,
    pub declared_tests: usize,
    pub selected_tests: usize,
    pub passed_tests: usize,
    pub passed_known_failing_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    pub todo_tests: usize,
    pub failed_hooks: usize,
    pub uncaught_exceptions: usize,
    pub unhandled_rejections: usize,
    pub finished_workers: usize,
    pub failed_workers: usize,
    pub timeouts: usize,
    pub timed_out_tests: usize,
    pub internal_errors: usize,
    pub interrupted: bool,
    pub by_file: BTreeMap<PathBuf, FileStats>,
}

impl Stats {
    /// Selected tests that have not reached a pass or a failure.
    pub fn remaining_tests(&self) -> usize {
        self.selected_tests
            .saturating_sub(self.skipped_tests)
            .saturating_sub(self.todo_tests)
            .saturating_sub(self.passed_tests)
            .saturating_sub(self.passed_known_failing_tests)
            .saturating_sub(self.failed_tests)
    }

    /// Workers that reached a terminal state, successfully or not.
    pub fn terminated_workers(&self) -> usize {
        self.finished_workers + self.failed_workers
    }
}

/// The partition this job is responsible for in a distributed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParallelRunInfo {
    pub current_index: usize,
    pub total_runs: usize,
    /// Number of files that landed in this job's partition.
    pub current_file_count: usize,
}

/// What the file selector found and how the selection was narrowed down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionInsights {
    /// Filters applied to the candidate files (e.g. from the command line).
    pub filter: Vec<String>,
    /// Candidate files dropped because they matched an ignore pattern.
    pub ignored_files: usize,
    /// Number of candidate test files before filtering.
    pub test_file_count: usize,
    /// Number of files left after filtering.
    pub selection_count: usize,
}

/// The finalized (or snapshotted) state of a run, returned by [`crate::core::status::RunStatus::end`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub stats: Stats,
    pub parallel_run: Option<ParallelRunInfo>,
    /// `true` when this job's partition received zero files.
    pub empty_parallel_run: bool,
    pub insights: SelectionInsights,
}

impl RunSummary {
    /// Files with at least one failed test or failed hook.
    pub fn failing_files(&self) -> BTreeSet<PathBuf> {
        self.stats
            .by_file
            .iter()
            .filter(|(_, stats)| stats.has_failures())
            .map(|(file, _)| file.clone())
            .collect()
    }

    /// Number of files this job was supposed to run.
    pub fn scheduled_files(&self) -> usize {
        self.parallel_run
            .map(|info| info.current_file_count)
            .unwrap_or(self.stats.files)
    }

    /// Scheduled files that never reached a terminal state, e.g. after a fail-fast bail-out.
    pub fn files_not_run(&self) -> usize {
        self.scheduled_files()
            .saturating_sub(self.stats.terminated_workers())
    }

    /// Suggests a process exit code for this run.
    ///
    /// `matching` is true when the user narrowed the selection with filters, in which
    /// case selecting no test at all is an error.
    pub fn suggest_exit_code(&self, matching: bool) -> u8 {
        if self.empty_parallel_run {
            return 0;
        }

        let stats = &self.stats;
        if matching && stats.selected_tests == 0 {
            return 1;
        }

        let nothing_ran = stats.declared_tests == 0 && stats.finished_workers == 0;
        if nothing_ran
            || stats.internal_errors > 0
            || stats.failed_hooks > 0
            || stats.failed_tests > 0
            || stats.failed_workers > 0
            || stats.timeouts > 0
            || stats.uncaught_exceptions > 0
            || stats.unhandled_rejections > 0
            || stats.interrupted
        {
            return 1;
        }

        0
    }
}

/// The announcement sent once per run, before any state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub files: Vec<PathBuf>,
    pub concurrency: usize,
    pub fail_fast: bool,
    pub debug: bool,
    /// Whether filters narrowed the selection.
    pub matching: bool,
    /// Number of files known to have failed in the previous run.
    pub previous_failures: usize,
    pub parallel_run: Option<ParallelRunInfo>,
    pub empty_parallel_run: bool,
    pub insights: SelectionInsights,
}

/// Everything a reporter can observe, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Run(Box<RunPlan>),
    StateChange(StatusEvent),
}
