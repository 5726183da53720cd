//! # isorun Library / isorun 库
//!
//! The orchestration core of a test runner: every test file runs in its own
//! worker process, with a bounded number of concurrent workers, an idle-activity
//! watchdog, fail-fast, graceful interruption and one ordered status stream that
//! reporters consume.
//!
//! 测试运行器的编排核心：每个测试文件在独立的 worker 进程中运行，
//! 并发 worker 数量有上限，带有空闲活动看门狗、快速失败、优雅中断，
//! 以及一个供报告器消费的有序状态流。
//!
//! ## Modules / 模块
//!
//! - `core` - Data models, configuration, watchdog, run status and the orchestrator
//! - `infra` - Process workers, file selection, failure cache, signals and logging
//! - `reporting` - Console and JSON reporting
//! - `cli` - Command-line interface and commands
//!
//! - `core` - 数据模型、配置、看门狗、运行状态和编排器
//! - `infra` - 进程 worker、文件选择、失败缓存、信号和日志
//! - `reporting` - 控制台和 JSON 报告
//! - `cli` - 命令行接口和命令

pub mod cli;
pub mod core;
pub mod infra;
pub mod reporting;

// Re-export commonly used items
pub use core::config;
pub use core::models;
pub use core::orchestrator::Orchestrator;

// Initialize i18n
rust_i18n::i18n!("locales", fallback = "en");

/// Picks the best available locale for `requested`, or for the system locale when absent.
///
/// It attempts to match the full locale (e.g., "zh-CN"), then just the language
/// code (e.g., "en"), and finally falls back to "en".
pub fn resolve_locale(requested: Option<&str>) -> String {
    let locale = requested
        .map(str::to_string)
        .or_else(sys_locale::get_locale)
        .unwrap_or_else(|| "en".to_string());
    let available_locales = rust_i18n::available_locales!();

    if available_locales.contains(&locale.as_str()) {
        return locale;
    }
    locale
        .split(['-', '_'])
        .next()
        .filter(|lang_code| available_locales.contains(lang_code))
        .unwrap_or("en")
        .to_string()
}
