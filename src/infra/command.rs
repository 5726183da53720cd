//! # Process Worker Module / 进程 Worker 模块
//!
//! Runs every test file in its own child process. The command template comes from
//! the configuration; the child reports structured events by printing lines that
//! start with [`EVENT_PREFIX`] followed by a JSON [`WorkerMessage`]. Every other
//! stdout line is passed through as `worker-stdout`, every stderr line as
//! `worker-stderr`.
//!
//! 在独立的子进程中运行每个测试文件。命令模板来自配置；子进程通过打印以
//! [`EVENT_PREFIX`] 开头、后跟 JSON [`WorkerMessage`] 的行来报告结构化事件。
//! 其他 stdout 行作为 `worker-stdout` 透传，stderr 行作为 `worker-stderr` 透传。

use anyhow::{Context, Result, anyhow, bail};
use futures::future::{BoxFuture, FutureExt, join_all};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::models::{StateChange, WorkerMessage};
use crate::core::worker::{
    ChannelControl, WorkerHandle, WorkerLauncher, WorkerOptions, WorkerSignal,
};

/// Stdout lines starting with this prefix carry a JSON worker message.
pub const EVENT_PREFIX: &str = "@@isorun ";

/// Written to a worker's stdin when another worker failed under fail-fast.
pub const PEER_FAILED_MESSAGE: &str = r#"{"type":"peer-failed"}"#;

/// How long output readers may keep running after a forced exit.
const FORCED_EXIT_READER_GRACE: Duration = Duration::from_secs(1);

/// Splits a command template into a program and its arguments for one file.
///
/// The template is split with shell quoting rules first, then `~` and environment
/// variables are expanded inside each argument. Unknown variables are left as
/// written. Each `{file}` is replaced by `file`; if the template has no placeholder
/// the file becomes the last argument. `interpreter_args` are inserted right after
/// the program.
///
/// 将命令模板拆分为一个文件的程序及其参数。
pub fn build_command_line(
    template: &str,
    file: &Path,
    interpreter_args: &[String],
) -> Result<(String, Vec<String>)> {
    let mut parts = shlex::split(template)
        .ok_or_else(|| anyhow!("Worker command has unbalanced quotes: {template}"))?
        .into_iter()
        .map(|part| expand(&part));
    let Some(program) = parts.next() else {
        bail!("Worker command is empty");
    };

    let file = file.to_string_lossy();
    let mut substituted = false;
    let mut args: Vec<String> = interpreter_args.to_vec();
    for part in parts {
        if part.contains("{file}") {
            substituted = true;
            args.push(part.replace("{file}", &file));
        } else {
            args.push(part);
        }
    }
    if !substituted {
        args.push(file.into_owned());
    }

    Ok((program, args))
}

fn expand(part: &str) -> String {
    let part = shellexpand::tilde(part);
    shellexpand::env_with_context_no_errors(&*part, |var| std::env::var(var).ok())
        .into_owned()
}

/// Launches one child process per test file.
///
/// Each worker gets a private scratch directory as `TMPDIR`; the directories are
/// removed by [`WorkerLauncher::cleanup`] once the run has drained.
pub struct ProcessLauncher {
    command: String,
    scratch: Arc<Mutex<Vec<TempDir>>>,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            scratch: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn scratch_dir(&self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("isorun-")
            .tempdir()
            .context("Failed to create worker scratch directory")?;
        let path = dir.path().to_path_buf();
        self.scratch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dir);
        Ok(path)
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        file: &Path,
        options: &WorkerOptions,
        interpreter_args: &[String],
    ) -> Result<WorkerHandle> {
        let (program, args) = build_command_line(&self.command, file, interpreter_args)?;
        let scratch = self.scratch_dir()?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&options.project_root)
            .env("ISORUN_TEST_FILE", file)
            .env("ISORUN_FAIL_FAST", if options.fail_fast { "1" } else { "0" })
            .env("TMPDIR", &scratch)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn `{program}`"))?;
        debug!(file = %file.display(), %program, ?args, pid = ?child.id(), "spawned worker");

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .context("Failed to capture worker stdout")?;
        let stderr = child
            .stderr
            .take()
            .context("Failed to capture worker stderr")?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control, signals) = ChannelControl::channel();

        let readers = [
            tokio::spawn(read_lines(stdout, events_tx.clone(), parse_stdout_line)),
            tokio::spawn(read_lines(stderr, events_tx.clone(), |line| {
                StateChange::WorkerStderr {
                    chunk: format!("{line}\n"),
                }
            })),
        ];

        let supervisor = tokio::spawn(supervise(child, stdin, signals, readers, events_tx));
        let label = file.display().to_string();
        let completion = async move {
            if let Err(error) = supervisor.await {
                warn!(file = %label, %error, "worker supervisor panicked");
            }
        };

        Ok(WorkerHandle::new(file, Arc::new(control), events_rx, completion))
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        let scratch = Arc::clone(&self.scratch);
        async move {
            let dirs = std::mem::take(&mut *scratch.lock().unwrap_or_else(PoisonError::into_inner));
            if dirs.is_empty() {
                return;
            }
            let removal = tokio::task::spawn_blocking(move || {
                for dir in dirs {
                    let path = dir.path().to_path_buf();
                    if let Err(error) = dir.close() {
                        warn!(path = %path.display(), %error, "failed to remove scratch directory");
                    }
                }
            });
            if let Err(error) = removal.await {
                warn!(%error, "scratch directory cleanup panicked");
            }
        }
        .boxed()
    }
}

/// Interprets one stdout line of a worker.
fn parse_stdout_line(line: String) -> StateChange {
    let Some(payload) = line.strip_prefix(EVENT_PREFIX) else {
        return StateChange::WorkerStdout {
            chunk: format!("{line}\n"),
        };
    };
    match serde_json::from_str::<WorkerMessage>(payload) {
        Ok(message) => message.into(),
        Err(error) => StateChange::InternalError {
            message: format!("Invalid worker message `{payload}`: {error}"),
        },
    }
}

async fn read_lines<R, F>(reader: R, events: mpsc::UnboundedSender<StateChange>, to_change: F)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> StateChange,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if events.send(to_change(line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                debug!(%error, "stopped reading worker output");
                break;
            }
        }
    }
}

/// Waits for the child, relaying control signals, then emits the terminal event.
async fn supervise(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    mut signals: mpsc::UnboundedReceiver<WorkerSignal>,
    readers: [JoinHandle<()>; 2],
    events: mpsc::UnboundedSender<StateChange>,
) {
    let mut forced_exit = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signals.recv() => match signal {
                WorkerSignal::NotifyOfPeerFailure => {
                    if let Some(pipe) = stdin.as_mut() {
                        let message = format!("{PEER_FAILED_MESSAGE}\n");
                        if let Err(error) = pipe.write_all(message.as_bytes()).await {
                            debug!(%error, "worker stdin closed before peer failure notice");
                            stdin = None;
                        }
                    }
                }
                WorkerSignal::Exit => {
                    forced_exit = true;
                    if let Err(error) = child.start_kill() {
                        debug!(%error, "failed to kill worker");
                    }
                }
            },
        }
    };
    drop(stdin);

    // Output is forwarded before the terminal event. A forced exit still wins while
    // a leftover process keeps the pipes open.
    let abort_handles: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    let mut drain = join_all(readers);
    let mut drained = false;
    while !forced_exit && !drained {
        tokio::select! {
            results = &mut drain => {
                drained = true;
                for result in results {
                    if let Err(error) = result {
                        warn!(%error, "worker output reader panicked");
                    }
                }
            }
            Some(signal) = signals.recv() => {
                if signal == WorkerSignal::Exit {
                    forced_exit = true;
                }
            }
        }
    }
    if !drained && tokio::time::timeout(FORCED_EXIT_READER_GRACE, &mut drain).await.is_err() {
        debug!("worker output still open after forced exit, abandoning it");
        for handle in abort_handles {
            handle.abort();
        }
    }

    let _ = events.send(terminal_change(status, forced_exit));
}

fn terminal_change(status: std::io::Result<ExitStatus>, forced_exit: bool) -> StateChange {
    if forced_exit {
        return StateChange::WorkerFinished { forced_exit: true };
    }
    match status {
        Ok(status) if status.success() => StateChange::WorkerFinished { forced_exit: false },
        Ok(status) => StateChange::WorkerFailed {
            exit_code: status.code(),
            signal: exit_signal(&status),
            message: None,
        },
        Err(error) => StateChange::WorkerFailed {
            exit_code: None,
            signal: None,
            message: Some(format!("Failed to wait for worker: {error}")),
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
