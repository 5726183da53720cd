//! # Run Status Module / 运行状态模块
//!
//! The single place where every worker's state changes are observed, counted and
//! re-broadcast in arrival order. Reporters and the orchestrator both subscribe to
//! the same ordered stream.
//!
//! 观察、统计并按到达顺序重新广播每个 worker 状态变化的唯一位置。
//! 报告器和编排器都订阅同一个有序事件流。

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::models::{
    FileStats, ParallelRunInfo, PendingTests, RunEvent, RunPlan, RunSummary, SelectionInsights,
    StateChange, Stats, StatusEvent,
};

/// Metadata recorded when a worker starts being observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerMeta {
    pub launch_index: usize,
}

struct StatusState {
    stats: Stats,
    parallel_run: Option<ParallelRunInfo>,
    insights: SelectionInsights,
    pending_tests: PendingTests,
    subscribers: Vec<mpsc::UnboundedSender<RunEvent>>,
    finalized: Option<RunSummary>,
}

impl StatusState {
    fn summary(&self) -> RunSummary {
        RunSummary {
            stats: self.stats.clone(),
            parallel_run: self.parallel_run,
            empty_parallel_run: self
                .parallel_run
                .is_some_and(|info| info.current_file_count == 0),
            insights: self.insights.clone(),
        }
    }

    fn broadcast(&mut self, event: RunEvent) {
        // Subscribers that went away are dropped.
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn file_stats(&mut self, file: Option<&PathBuf>) -> Option<&mut FileStats> {
        let file = file?;
        Some(self.stats.by_file.entry(file.clone()).or_default())
    }

    fn count(&mut self, event: &mut StatusEvent) {
        let file = event.test_file.clone();
        match &mut event.change {
            StateChange::DeclaredTest { .. } => {
                self.stats.declared_tests += 1;
                if let Some(stats) = self.file_stats(file.as_ref()) {
                    stats.declared_tests += 1;
                }
            }
            StateChange::SelectedTest { title, skip, todo } => {
                self.stats.selected_tests += 1;
                if *skip {
                    self.stats.skipped_tests += 1;
                } else if *todo {
                    self.stats.todo_tests += 1;
                } else if let Some(file) = &file {
                    self.pending_tests
                        .entry(file.clone())
                        .or_default()
                        .insert(title.clone());
                }
                let (skip, todo) = (*skip, *todo);
                if let Some(stats) = self.file_stats(file.as_ref()) {
                    stats.selected_tests += 1;
                    if skip {
                        stats.skipped_tests += 1;
                    } else if todo {
                        stats.todo_tests += 1;
                    }
                }
            }
            StateChange::TestPassed {
                title,
                known_failing,
                ..
            } => {
                let known_failing = *known_failing;
                if known_failing {
                    self.stats.passed_known_failing_tests += 1;
                } else {
                    self.stats.passed_tests += 1;
                }
                self.settle_pending_test(file.as_ref(), title);
                if let Some(stats) = self.file_stats(file.as_ref()) {
                    if known_failing {
                        stats.passed_known_failing_tests += 1;
                    } else {
                        stats.passed_tests += 1;
                    }
                }
            }
            StateChange::TestFailed { title, .. } => {
                self.stats.failed_tests += 1;
                self.settle_pending_test(file.as_ref(), title);
                if let Some(stats) = self.file_stats(file.as_ref()) {
                    stats.failed_tests += 1;
                }
            }
            StateChange::HookFailed { .. } => {
                self.stats.failed_hooks += 1;
                if let Some(stats) = self.file_stats(file.as_ref()) {
                    stats.failed_hooks += 1;
                }
            }
            StateChange::UncaughtException { .. } => {
                self.stats.uncaught_exceptions += 1;
                if let Some(stats) = self.file_stats(file.as_ref()) {
                    stats.uncaught_exceptions += 1;
                }
            }
            StateChange::UnhandledRejection { .. } => {
                self.stats.unhandled_rejections += 1;
                if let Some(stats) = self.file_stats(file.as_ref()) {
                    stats.unhandled_rejections += 1;
                }
            }
            StateChange::WorkerFinished { .. } => self.stats.finished_workers += 1,
            StateChange::WorkerFailed { .. } => self.stats.failed_workers += 1,
            StateChange::Timeout { pending_tests, .. } => {
                self.stats.timeouts += 1;
                self.stats.timed_out_tests +=
                    self.pending_tests.values().map(BTreeSet::len).sum::<usize>();
                pending_tests.clone_from(&self.pending_tests);
            }
            StateChange::Interrupt { pending_tests } => {
                self.stats.interrupted = true;
                pending_tests.clone_from(&self.pending_tests);
            }
            StateChange::InternalError { .. } => {
                self.stats.internal_errors += 1;
                if let Some(stats) = self.file_stats(file.as_ref()) {
                    stats.internal_errors += 1;
                }
            }
            StateChange::TestTimeoutConfigured { .. }
            | StateChange::WorkerStdout { .. }
            | StateChange::WorkerStderr { .. }
            | StateChange::TouchedFiles { .. }
            | StateChange::Stats { .. } => {}
        }
    }

    fn settle_pending_test(&mut self, file: Option<&PathBuf>, title: &str) {
        let Some(file) = file else { return };
        if let Some(tests) = self.pending_tests.get_mut(file) {
            tests.remove(title);
            if tests.is_empty() {
                self.pending_tests.remove(file);
            }
        }
    }
}

/// Shared handle to the aggregated status of one run.
///
/// Cloning is cheap; all clones observe and mutate the same state. Once
/// [`RunStatus::end`] has been called, further events are ignored.
///
/// 一次运行聚合状态的共享句柄。克隆开销很小；所有克隆共享同一状态。
#[derive(Clone)]
pub struct RunStatus {
    inner: Arc<Mutex<StatusState>>,
}

impl RunStatus {
    /// Creates the status for a run over `files` test files (counted before partitioning).
    pub fn new(
        files: usize,
        parallel_run: Option<ParallelRunInfo>,
        insights: SelectionInsights,
        subscribers: Vec<mpsc::UnboundedSender<RunEvent>>,
    ) -> Self {
        let stats = Stats {
            files,
            ..Stats::default()
        };
        Self {
            inner: Arc::new(Mutex::new(StatusState {
                stats,
                parallel_run,
                insights,
                pending_tests: PendingTests::new(),
                subscribers,
                finalized: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to every event emitted from now on, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Sends the run announcement to current subscribers.
    pub fn announce(&self, plan: RunPlan) {
        self.lock().broadcast(RunEvent::Run(Box::new(plan)));
    }

    /// Starts forwarding a worker's events, tagged with `file`.
    ///
    /// The returned task ends once the worker's event stream closes.
    pub fn observe_worker(
        &self,
        file: PathBuf,
        meta: WorkerMeta,
        mut events: mpsc::UnboundedReceiver<StateChange>,
    ) -> JoinHandle<()> {
        self.lock()
            .stats
            .by_file
            .insert(file.clone(), FileStats::new(meta.launch_index));

        let status = self.clone();
        tokio::spawn(async move {
            while let Some(change) = events.recv().await {
                status.emit_state_change(StatusEvent::for_file(file.clone(), change));
            }
            debug!(file = %file.display(), "worker event stream closed");
        })
    }

    /// Counts `event` and forwards it to every subscriber.
    pub fn emit_state_change(&self, mut event: StatusEvent) {
        let mut state = self.lock();
        if state.finalized.is_some() {
            debug!(?event.change, "ignoring state change after the run ended");
            return;
        }
        state.count(&mut event);
        state.broadcast(RunEvent::StateChange(event));
    }

    /// Tests that were selected but have not passed or failed yet.
    pub fn pending_tests(&self) -> PendingTests {
        self.lock().pending_tests.clone()
    }

    /// Files where a test or a hook failed so far.
    pub fn failed_test_files(&self) -> BTreeSet<PathBuf> {
        self.snapshot().failing_files()
    }

    /// The current state, without finalizing the run.
    pub fn snapshot(&self) -> RunSummary {
        self.lock().summary()
    }

    pub fn is_ended(&self) -> bool {
        self.lock().finalized.is_some()
    }

    /// Marks the run complete, emits the final `stats` event and returns the summary.
    ///
    /// Calling it again returns the same summary without emitting anything.
    pub fn end(&self) -> RunSummary {
        let mut state = self.lock();
        if let Some(summary) = &state.finalized {
            return summary.clone();
        }

        let summary = state.summary();
        state.broadcast(RunEvent::StateChange(StatusEvent::run_level(
            StateChange::Stats {
                stats: Box::new(summary.stats.clone()),
            },
        )));
        state.finalized = Some(summary.clone());
        summary
    }
}
