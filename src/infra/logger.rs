//! # Logging Module / 日志模块
//!
//! Diagnostic logging goes through `tracing` to stderr. User-facing output does not.
//!
//! 诊断日志通过 `tracing` 输出到 stderr。面向用户的输出不经过这里。

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the crate logs at `warn`, or at `info` with
/// `verbose`. Calling this more than once is harmless.
pub fn init_logger(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("isorun={default_level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
