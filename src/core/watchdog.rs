//! # Idle Watchdog Module / 空闲看门狗模块
//!
//! A debounced, suppressible idle-timeout trigger. Every bit of worker activity
//! pushes the deadline back; if the deadline passes without activity the callback
//! runs, unless a test announced that it legitimately needs longer.
//!
//! 一个可去抖、可抑制的空闲超时触发器。每次 worker 活动都会推迟截止时间；
//! 如果截止时间过去而没有任何活动，则运行回调，除非某个测试声明它确实需要更长时间。

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

type Callback = Box<dyn Fn() + Send + Sync>;

struct Shared {
    state: Mutex<TimerState>,
    callback: Callback,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct TimerState {
    /// When the pending timer should fire. `None` means no timer is armed.
    deadline: Option<Instant>,
    /// Firings before this instant are swallowed.
    ignore_until: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

/// Fires a callback after `wait` of inactivity.
///
/// `debounce` may be called from any task; the last call wins. The timer task
/// re-reads the shared deadline when it wakes up, so resetting it never needs to
/// cancel and respawn anything.
///
/// 在 `wait` 时间无活动后触发回调。`debounce` 可以从任何任务调用，最后一次调用生效。
pub struct Watchdog {
    wait: Duration,
    shared: Arc<Shared>,
}

impl Watchdog {
    /// Creates a watchdog. Nothing is armed until the first [`Watchdog::debounce`].
    pub fn new<F>(wait: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            wait,
            shared: Arc::new(Shared {
                state: Mutex::new(TimerState::default()),
                callback: Box::new(callback),
            }),
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// (Re)schedules the firing at now + wait. Must be called within a Tokio runtime.
    pub fn debounce(&self) {
        let mut state = self.shared.lock();
        state.deadline = Some(Instant::now() + self.wait);
        if state.timer.is_none() {
            state.timer = Some(tokio::spawn(run_timer(Arc::clone(&self.shared))));
        }
    }

    /// Raises the ignore horizon to `max(horizon, now + period)`. Never lowers it.
    pub fn ignore_for(&self, period: Duration) {
        let until = Instant::now() + period;
        let mut state = self.shared.lock();
        state.ignore_until = Some(match state.ignore_until {
            Some(current) if current > until => current,
            _ => until,
        });
    }

    /// Cancels the pending timer, if any. A later `debounce` arms it again.
    pub fn discard(&self) {
        let mut state = self.shared.lock();
        state.deadline = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Whether a timer is currently armed.
    pub fn is_armed(&self) -> bool {
        self.shared.lock().deadline.is_some()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.discard();
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Watchdog")
            .field("wait", &self.wait)
            .field("deadline", &state.deadline)
            .field("ignore_until", &state.ignore_until)
            .finish_non_exhaustive()
    }
}

async fn run_timer(shared: Arc<Shared>) {
    loop {
        let deadline = match shared.lock().deadline {
            Some(deadline) => deadline,
            None => return,
        };

        time::sleep_until(deadline).await;

        let should_fire = {
            let mut state = shared.lock();
            match state.deadline {
                // Debounced while we slept.
                Some(deadline) if deadline > Instant::now() => continue,
                // Discarded while we slept.
                None => return,
                Some(_) => {}
            }

            state.deadline = None;
            state.timer = None;
            let now = Instant::now();
            state.ignore_until.is_none_or(|until| now >= until)
        };

        if should_fire {
            (shared.callback)();
        } else {
            debug!("watchdog fired inside the ignore horizon; staying silent");
        }
        return;
    }
}
