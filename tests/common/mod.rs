// Shared test helpers for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use isorun::config::RunConfig;
use isorun::core::models::{RunEvent, SelectionInsights, StateChange, StatusEvent};
use isorun::core::orchestrator::{FileSelector, HostInfo, Orchestrator, Selection};
use isorun::core::worker::{
    WorkerControl, WorkerHandle, WorkerLauncher, WorkerOptions, WorkerSignal,
};
use tokio::sync::mpsc;

/// One step of a scripted fake worker.
#[derive(Debug, Clone)]
pub enum Step {
    Emit(StateChange),
    Sleep(Duration),
    /// Waits until the worker is force-exited.
    Hang,
    /// Exits successfully.
    Finish,
    /// Exits with a non-zero code.
    Fail(i32),
}

pub fn passed(title: &str) -> Step {
    Step::Emit(StateChange::TestPassed {
        title: title.to_string(),
        duration_ms: 1,
        known_failing: false,
    })
}

pub fn failed(title: &str) -> Step {
    Step::Emit(StateChange::TestFailed {
        title: title.to_string(),
        duration_ms: 1,
        message: Some("assertion failed".to_string()),
    })
}

pub fn selected(title: &str) -> Step {
    Step::Emit(StateChange::SelectedTest {
        title: title.to_string(),
        skip: false,
        todo: false,
    })
}

pub fn sleep_ms(ms: u64) -> Step {
    Step::Sleep(Duration::from_millis(ms))
}

/// What the fake launcher observed during a run.
#[derive(Debug, Default)]
pub struct LaunchLog {
    pub launched: Vec<PathBuf>,
    pub running: usize,
    pub max_running: usize,
    pub exits: HashMap<PathBuf, usize>,
    pub notifications: HashMap<PathBuf, usize>,
    pub interpreter_args: Vec<Vec<String>>,
    pub cleanups: usize,
}

impl LaunchLog {
    pub fn exits_for(&self, file: &str) -> usize {
        self.exits.get(Path::new(file)).copied().unwrap_or(0)
    }

    pub fn notifications_for(&self, file: &str) -> usize {
        self.notifications.get(Path::new(file)).copied().unwrap_or(0)
    }
}

struct RecordingControl {
    file: PathBuf,
    log: Arc<Mutex<LaunchLog>>,
    tx: mpsc::UnboundedSender<WorkerSignal>,
}

impl WorkerControl for RecordingControl {
    fn exit(&self) {
        *self
            .log
            .lock()
            .unwrap()
            .exits
            .entry(self.file.clone())
            .or_default() += 1;
        let _ = self.tx.send(WorkerSignal::Exit);
    }

    fn notify_of_peer_failure(&self) {
        *self
            .log
            .lock()
            .unwrap()
            .notifications
            .entry(self.file.clone())
            .or_default() += 1;
        let _ = self.tx.send(WorkerSignal::NotifyOfPeerFailure);
    }
}

/// A launcher whose workers follow scripts instead of running processes.
#[derive(Default)]
pub struct FakeLauncher {
    scripts: HashMap<PathBuf, Vec<Step>>,
    default_script: Vec<Step>,
    unlaunchable: HashSet<PathBuf>,
    pub log: Arc<Mutex<LaunchLog>>,
}

impl FakeLauncher {
    /// Every worker passes one test and exits successfully.
    pub fn new() -> Self {
        Self::with_default(vec![passed("works"), Step::Finish])
    }

    pub fn with_default(default_script: Vec<Step>) -> Self {
        Self {
            default_script,
            ..Self::default()
        }
    }

    pub fn script(mut self, file: &str, steps: Vec<Step>) -> Self {
        self.scripts.insert(PathBuf::from(file), steps);
        self
    }

    pub fn unlaunchable(mut self, file: &str) -> Self {
        self.unlaunchable.insert(PathBuf::from(file));
        self
    }

    pub fn log(&self) -> Arc<Mutex<LaunchLog>> {
        Arc::clone(&self.log)
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(
        &self,
        file: &Path,
        _options: &WorkerOptions,
        interpreter_args: &[String],
    ) -> anyhow::Result<WorkerHandle> {
        if self.unlaunchable.contains(file) {
            bail!("no such interpreter");
        }

        {
            let mut log = self.log.lock().unwrap();
            log.launched.push(file.to_path_buf());
            log.interpreter_args.push(interpreter_args.to_vec());
            log.running += 1;
            log.max_running = log.max_running.max(log.running);
        }

        let steps = self
            .scripts
            .get(file)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let control = RecordingControl {
            file: file.to_path_buf(),
            log: Arc::clone(&self.log),
            tx: signal_tx,
        };

        let log = Arc::clone(&self.log);
        let task = tokio::spawn(async move {
            play(steps, events_tx, signal_rx).await;
            log.lock().unwrap().running -= 1;
        });
        let completion = async move {
            let _ = task.await;
        };

        Ok(WorkerHandle::new(file, Arc::new(control), events_rx, completion))
    }

    fn cleanup(&self) -> futures::future::BoxFuture<'_, ()> {
        self.log.lock().unwrap().cleanups += 1;
        Box::pin(async {})
    }
}

async fn play(
    steps: Vec<Step>,
    events: mpsc::UnboundedSender<StateChange>,
    mut signals: mpsc::UnboundedReceiver<WorkerSignal>,
) {
    for step in steps {
        match step {
            Step::Emit(change) => {
                let _ = events.send(change);
            }
            Step::Sleep(duration) => {
                let sleep = tokio::time::sleep(duration);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        Some(signal) = signals.recv() => {
                            if signal == WorkerSignal::Exit {
                                let _ = events.send(StateChange::WorkerFinished { forced_exit: true });
                                return;
                            }
                        }
                    }
                }
            }
            Step::Hang => {
                while let Some(signal) = signals.recv().await {
                    if signal == WorkerSignal::Exit {
                        let _ = events.send(StateChange::WorkerFinished { forced_exit: true });
                        return;
                    }
                }
                return;
            }
            Step::Finish => {
                let _ = events.send(StateChange::WorkerFinished { forced_exit: false });
                return;
            }
            Step::Fail(code) => {
                let _ = events.send(StateChange::WorkerFailed {
                    exit_code: Some(code),
                    signal: None,
                    message: None,
                });
                return;
            }
        }
    }
}

/// Returns a fixed list of files.
pub struct StaticSelector {
    pub selection: Selection,
}

impl StaticSelector {
    pub fn new(files: &[&str]) -> Self {
        let files: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
        Self {
            selection: Selection {
                insights: SelectionInsights {
                    test_file_count: files.len(),
                    selection_count: files.len(),
                    ..SelectionInsights::default()
                },
                files,
            },
        }
    }

    pub fn filtered(mut self, filter: &str) -> Self {
        self.selection.insights.filter.push(filter.to_string());
        self
    }
}

impl FileSelector for StaticSelector {
    fn select(&self) -> anyhow::Result<Selection> {
        Ok(self.selection.clone())
    }
}

pub struct FailingSelector;

impl FileSelector for FailingSelector {
    fn select(&self) -> anyhow::Result<Selection> {
        bail!("pattern `[` is not valid")
    }
}

/// A configuration with the cache disabled and the given concurrency.
pub fn test_config(concurrency: usize) -> RunConfig {
    RunConfig {
        concurrency: Some(concurrency),
        cache: false,
        ..RunConfig::default()
    }
}

pub fn orchestrator(
    config: RunConfig,
    selector: impl FileSelector + 'static,
    launcher: FakeLauncher,
) -> (Orchestrator, Arc<Mutex<LaunchLog>>) {
    let log = launcher.log();
    let orchestrator = Orchestrator::new(config, "/project", Arc::new(selector), Arc::new(launcher))
        .with_host(HostInfo {
            is_ci: false,
            logical_cpus: 4,
        });
    (orchestrator, log)
}

/// Everything already delivered to `rx`.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// The state changes in `events`, in order.
pub fn changes(events: &[RunEvent]) -> Vec<&StatusEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::StateChange(event) => Some(event),
            RunEvent::Run(_) => None,
        })
        .collect()
}

/// The state changes of one file, in order.
pub fn changes_for<'a>(events: &'a [RunEvent], file: &str) -> Vec<&'a StateChange> {
    changes(events)
        .into_iter()
        .filter(|event| event.file() == Some(Path::new(file)))
        .map(|event| &event.change)
        .collect()
}
