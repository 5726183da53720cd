//! # Run Orchestrator Module / 运行编排模块
//!
//! The top-level control loop of a run. It selects and schedules files, drives
//! them through a bounded pool of workers, wires the idle watchdog, fail-fast and
//! interrupt handling, persists the failure cache and finalizes the run status.
//!
//! A run moves through `selecting → scheduling → running → draining → finalized`.
//! Every fault along the way becomes an event in the status stream; [`Orchestrator::run`]
//! itself never fails.
//!
//! 运行的顶层控制循环。它选择并调度文件，通过有界的 worker 池驱动它们，
//! 连接空闲看门狗、快速失败和中断处理，持久化失败缓存并最终确定运行状态。
//! 途中的每个故障都会成为状态流中的事件；[`Orchestrator::run`] 本身从不失败。

use anyhow::Context;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::RunConfig;
use crate::core::models::{
    RunEvent, RunPlan, RunSummary, SelectionInsights, StateChange, StatusEvent,
};
use crate::core::partition::FileComparator;
use crate::core::planner::{self, ExecutionPlan, PlanOptions};
use crate::core::status::{RunStatus, WorkerMeta};
use crate::core::watchdog::Watchdog;
use crate::core::worker::{WorkerControl, WorkerLauncher, WorkerOptions};
use crate::infra::cache::FailureCache;

/// The outcome of file selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub files: Vec<PathBuf>,
    pub insights: SelectionInsights,
}

/// Resolves the files a run should consider. Discovery itself lives outside the core.
pub trait FileSelector: Send + Sync {
    fn select(&self) -> anyhow::Result<Selection>;
}

/// Facts about the machine that influence the default concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub is_ci: bool,
    pub logical_cpus: usize,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            is_ci: is_ci::cached(),
            logical_cpus: num_cpus::get(),
        }
    }
}

/// Resolves the effective concurrency limit.
///
/// Explicit configuration wins; then serial mode forces 1; then CI defaults to 2;
/// otherwise the host's logical core count, never below 1.
pub fn resolve_concurrency(config: &RunConfig, host: HostInfo) -> usize {
    if let Some(concurrency) = config.concurrency.filter(|&c| c > 0) {
        return concurrency;
    }
    if config.serial {
        return 1;
    }
    if host.is_ci {
        return 2;
    }
    host.logical_cpus.max(1)
}

/// Drives one run at a time.
///
/// 一次驱动一次运行。
pub struct Orchestrator {
    config: RunConfig,
    project_root: PathBuf,
    selector: Arc<dyn FileSelector>,
    launcher: Arc<dyn WorkerLauncher>,
    comparator: Option<FileComparator>,
    host: HostInfo,
    listeners: Vec<mpsc::UnboundedSender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        project_root: impl Into<PathBuf>,
        selector: Arc<dyn FileSelector>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            project_root: project_root.into(),
            selector,
            launcher,
            comparator: None,
            host: HostInfo::detect(),
            listeners: Vec::new(),
        }
    }

    /// Uses a custom total order for sorting test files.
    pub fn with_comparator(mut self, comparator: FileComparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Overrides host detection.
    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }

    /// Receives the `run` announcement and every state change of subsequent runs.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn failure_cache(&self) -> FailureCache {
        let cache_dir = if self.config.cache_dir.is_absolute() {
            self.config.cache_dir.clone()
        } else {
            self.project_root.join(&self.config.cache_dir)
        };
        FailureCache::new(&cache_dir, &self.project_root)
    }

    /// Executes a run and returns its finalized summary.
    ///
    /// Cancelling `interrupt` stops admission of new files and force-exits the
    /// running ones.
    pub async fn run(&self, interrupt: CancellationToken) -> RunSummary {
        // selecting
        let (selection, selection_error) = match self.selector.select() {
            Ok(selection) => (selection, None),
            Err(error) => (Selection::default(), Some(error)),
        };
        let matching = !selection.insights.filter.is_empty();

        // scheduling
        let cache = self.failure_cache();
        let plan_options = PlanOptions {
            parallel: self.config.parallel,
            strategy: self.config.partition,
            sort: self.config.sort,
            comparator: self.comparator.as_ref(),
            cache: Some(&cache),
            cache_enabled: self.config.cache,
        };
        let (plan, plan_error) = match planner::plan_execution(selection.files, &plan_options) {
            Ok(plan) => (plan, None),
            Err(error) => (
                ExecutionPlan {
                    files_to_run: Vec::new(),
                    total_files: 0,
                    parallel_run: None,
                    previous_failures: 0,
                },
                Some(anyhow::Error::new(error).context("Failed to partition test files")),
            ),
        };

        let status = RunStatus::new(
            plan.total_files,
            plan.parallel_run,
            selection.insights.clone(),
            self.listeners.clone(),
        );
        let concurrency = resolve_concurrency(&self.config, self.host);
        let debug_mode = self.config.is_debug();
        let empty_parallel_run = plan
            .parallel_run
            .is_some_and(|info| info.current_file_count == 0);

        status.announce(RunPlan {
            files: plan.files_to_run.clone(),
            concurrency,
            fail_fast: self.config.fail_fast,
            debug: debug_mode,
            matching,
            previous_failures: plan.previous_failures,
            parallel_run: plan.parallel_run,
            empty_parallel_run,
            insights: selection.insights,
        });

        if let Some(error) = selection_error.or(plan_error) {
            warn!("{error:#}");
            status.emit_state_change(StatusEvent::run_level(StateChange::InternalError {
                message: format!("{error:#}"),
            }));
            return status.end();
        }

        if plan.files_to_run.is_empty() || (debug_mode && plan.files_to_run.len() > 1) {
            debug!(
                files = plan.files_to_run.len(),
                debug_mode, "nothing to run, finishing early"
            );
            return status.end();
        }

        // running + draining
        info!(
            files = plan.files_to_run.len(),
            concurrency,
            fail_fast = self.config.fail_fast,
            "starting run"
        );
        let timeout = self.config.timeout().filter(|_| !debug_mode);
        self.drive(&status, plan.files_to_run, concurrency, timeout, interrupt)
            .await;

        // The cache reflects every file that ran, including after a bail-out.
        if let Some(changed) = cache.persist(&status.snapshot(), self.config.cache) {
            if !changed.is_empty() {
                status.emit_state_change(StatusEvent::run_level(StateChange::TouchedFiles {
                    files: changed,
                }));
            }
        }

        // finalized
        status.end()
    }

    fn worker_options(&self) -> (WorkerOptions, Vec<String>) {
        let options = WorkerOptions {
            project_root: self.project_root.clone(),
            fail_fast: self.config.fail_fast,
            debug: self.config.is_debug(),
            env: self.config.worker.env.clone(),
        };
        let mut interpreter_args = self.config.worker.interpreter_args.clone();
        if let Some(debug) = &self.config.debug {
            interpreter_args.extend(debug.args.iter().cloned());
        }
        (options, interpreter_args)
    }

    /// Runs `files` through the bounded pool until every launched worker completed.
    async fn drive(
        &self,
        status: &RunStatus,
        files: Vec<PathBuf>,
        concurrency: usize,
        timeout: Option<Duration>,
        interrupt: CancellationToken,
    ) {
        let (options, interpreter_args) = self.worker_options();

        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
        let watchdog = timeout.map(|wait| {
            Watchdog::new(wait, move || {
                let _ = fire_tx.send(());
            })
        });

        let mut events = status.subscribe();
        let mut state = RunState::new(self.config.fail_fast);
        let mut queue = files.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut launched = 0usize;
        let mut watch_interrupt = true;

        loop {
            while !state.bailed && state.pending.len() < concurrency {
                if watch_interrupt && interrupt.is_cancelled() {
                    watch_interrupt = false;
                    state.interrupt(status, watchdog.as_ref());
                    continue;
                }
                let Some(file) = queue.next() else { break };

                let handle = match self
                    .launcher
                    .launch(&file, &options, &interpreter_args)
                    .with_context(|| format!("Failed to launch worker for {}", file.display()))
                {
                    Ok(handle) => handle,
                    Err(error) => {
                        warn!("{error:#}");
                        status.emit_state_change(StatusEvent::for_file(
                            file,
                            StateChange::WorkerFailed {
                                exit_code: None,
                                signal: None,
                                message: Some(format!("{error:#}")),
                            },
                        ));
                        // Fail-fast must see launch failures even though no worker is pending.
                        while let Ok(event) = events.try_recv() {
                            state.observe(&event, watchdog.as_ref());
                        }
                        continue;
                    }
                };

                let (file, control, worker_events, completion) = handle.into_parts();
                debug!(file = %file.display(), launched, "launching worker");
                let forwarder = status.observe_worker(
                    file.clone(),
                    WorkerMeta {
                        launch_index: launched,
                    },
                    worker_events,
                );
                launched += 1;
                state.pending.insert(file.clone(), control);
                if let Some(watchdog) = &watchdog {
                    watchdog.debounce();
                }

                in_flight.push(async move {
                    completion.await;
                    // All of the worker's events have been forwarded once this returns.
                    if let Err(error) = forwarder.await {
                        warn!(%error, "worker event forwarder panicked");
                    }
                    file
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = interrupt.cancelled(), if watch_interrupt => {
                    watch_interrupt = false;
                    state.interrupt(status, watchdog.as_ref());
                }
                Some(()) = fire_rx.recv() => {
                    if let Some(watchdog) = &watchdog {
                        state.time_out(status, watchdog.wait());
                    }
                }
                Some(event) = events.recv() => {
                    state.observe(&event, watchdog.as_ref());
                }
                Some(file) = in_flight.next() => {
                    while let Ok(event) = events.try_recv() {
                        state.observe(&event, watchdog.as_ref());
                    }
                    state.complete(&file);
                }
            }
        }

        drop(events);
        if let Some(watchdog) = &watchdog {
            watchdog.discard();
        }

        let not_started = queue.len();
        if not_started > 0 {
            info!(not_started, "run bailed before every file was started");
        }

        self.launcher.cleanup().await;
    }
}

/// Coordinator-owned state of a run in progress.
struct RunState {
    fail_fast: bool,
    /// Once true, no new worker is launched. Never reverts.
    bailed: bool,
    interrupted: bool,
    pending: HashMap<PathBuf, Arc<dyn WorkerControl>>,
    timed_out: HashSet<PathBuf>,
    notified: HashSet<PathBuf>,
}

impl RunState {
    fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            bailed: false,
            interrupted: false,
            pending: HashMap::new(),
            timed_out: HashSet::new(),
            notified: HashSet::new(),
        }
    }

    fn observe(&mut self, event: &RunEvent, watchdog: Option<&Watchdog>) {
        let RunEvent::StateChange(event) = event else {
            return;
        };
        let Some(file) = event.file() else {
            return;
        };

        if let Some(watchdog) = watchdog {
            if let StateChange::TestTimeoutConfigured { period_ms } = event.change {
                watchdog.ignore_for(Duration::from_millis(period_ms));
            }
            if !self.interrupted && !self.timed_out.contains(file) && !event.change.is_output() {
                watchdog.debounce();
            }
        }

        if self.fail_fast && event.change.is_failure() {
            self.bail_on_failure(file);
        }
    }

    fn bail_on_failure(&mut self, failed: &Path) {
        if !self.bailed {
            info!(file = %failed.display(), "failure under fail-fast, not starting new files");
        }
        self.bailed = true;

        for (file, control) in &self.pending {
            if self.timed_out.contains(file) || self.notified.contains(file) {
                continue;
            }
            control.notify_of_peer_failure();
            self.notified.insert(file.clone());
        }
    }

    fn time_out(&mut self, status: &RunStatus, period: Duration) {
        if self.interrupted {
            return;
        }
        if self.fail_fast {
            self.bailed = true;
        }

        warn!(
            pending = self.pending.len(),
            "no worker activity for {period:?}, exiting pending workers"
        );
        status.emit_state_change(StatusEvent::run_level(StateChange::Timeout {
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            pending_tests: Default::default(),
        }));

        for (file, control) in &self.pending {
            self.timed_out.insert(file.clone());
            control.exit();
        }
    }

    fn interrupt(&mut self, status: &RunStatus, watchdog: Option<&Watchdog>) {
        if self.bailed {
            debug!("interrupt received while already bailed; ignoring");
            return;
        }

        self.bailed = true;
        self.interrupted = true;
        if let Some(watchdog) = watchdog {
            watchdog.discard();
        }

        warn!(pending = self.pending.len(), "run interrupted");
        status.emit_state_change(StatusEvent::run_level(StateChange::Interrupt {
            pending_tests: Default::default(),
        }));

        for control in self.pending.values() {
            control.exit();
        }
    }

    fn complete(&mut self, file: &Path) {
        self.pending.remove(file);
    }
}
