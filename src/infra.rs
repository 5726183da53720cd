//! # Infrastructure Module / 基础设施模块
//!
//! Concrete services the core is wired to: process-backed workers, file
//! selection on disk, the failure cache, signal handling and logging setup.
//!
//! 核心所连接的具体服务：基于进程的 worker、磁盘上的文件选择、失败缓存、信号处理和日志设置。

pub mod cache;
pub mod command;
pub mod fs;
pub mod logger;
pub mod signal;

// Re-export i18n functions for easier access
pub use rust_i18n::t;
