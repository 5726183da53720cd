//! # Worker Handle Module / Worker 句柄模块
//!
//! The orchestrator's view of one out-of-process test-file execution. The
//! orchestrator never looks inside a worker: it launches one through a
//! [`WorkerLauncher`], reads its ordered event stream, waits for its completion
//! and can ask it to stop, either cooperatively or by force.
//!
//! 编排器对单个进程外测试文件执行的视图。编排器从不关心 worker 内部：
//! 它通过 [`WorkerLauncher`] 启动 worker，读取其有序事件流，等待其完成，
//! 并可以协作式或强制地要求它停止。

use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::models::StateChange;

/// The two strengths of cancellation a worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Another worker failed under fail-fast; wind down in-process concurrency.
    NotifyOfPeerFailure,
    /// Terminate now.
    Exit,
}

/// Control surface of a running worker. Both operations are fire-and-forget.
pub trait WorkerControl: Send + Sync {
    /// Forced termination.
    fn exit(&self);
    /// Cooperative stop request after a peer failed.
    fn notify_of_peer_failure(&self);
}

/// A [`WorkerControl`] that forwards signals over a channel to whatever supervises the worker.
#[derive(Debug, Clone)]
pub struct ChannelControl {
    tx: mpsc::UnboundedSender<WorkerSignal>,
}

impl ChannelControl {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, signal: WorkerSignal) {
        // The worker may already be gone; a signal to a finished worker is moot.
        let _ = self.tx.send(signal);
    }
}

impl WorkerControl for ChannelControl {
    fn exit(&self) {
        self.send(WorkerSignal::Exit);
    }

    fn notify_of_peer_failure(&self) {
        self.send(WorkerSignal::NotifyOfPeerFailure);
    }
}

/// One spawned test file.
///
/// Contract for implementors: the event stream yields the worker's state changes
/// strictly in occurrence order, ends with a terminal event (`worker-finished` or
/// `worker-failed`), and closes once the worker is done. The completion future
/// resolves when the worker is done, whatever the outcome.
pub struct WorkerHandle {
    file: PathBuf,
    control: Arc<dyn WorkerControl>,
    events: mpsc::UnboundedReceiver<StateChange>,
    completion: BoxFuture<'static, ()>,
}

impl WorkerHandle {
    pub fn new<F>(
        file: impl Into<PathBuf>,
        control: Arc<dyn WorkerControl>,
        events: mpsc::UnboundedReceiver<StateChange>,
        completion: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            file: file.into(),
            control,
            events,
            completion: completion.boxed(),
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        PathBuf,
        Arc<dyn WorkerControl>,
        mpsc::UnboundedReceiver<StateChange>,
        BoxFuture<'static, ()>,
    ) {
        (self.file, self.control, self.events, self.completion)
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("file", &self.file)
            .finish_non_exhaustive()
    }
}

/// The options bag handed to every launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    pub project_root: PathBuf,
    pub fail_fast: bool,
    pub debug: bool,
    pub env: BTreeMap<String, String>,
}

/// Starts workers. Implemented by the process launcher and by test doubles.
pub trait WorkerLauncher: Send + Sync {
    /// Launches a worker for `file`. Called from within the Tokio runtime.
    fn launch(
        &self,
        file: &Path,
        options: &WorkerOptions,
        interpreter_args: &[String],
    ) -> anyhow::Result<WorkerHandle>;

    /// Asynchronous cleanup awaited once every launched worker has completed.
    fn cleanup(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}
