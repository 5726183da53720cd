//! # Core Module / 核心模块
//!
//! The orchestration core of isorun: data models, configuration, the watchdog,
//! the worker contract, run status aggregation, partitioning and the orchestrator.
//!
//! isorun 的编排核心：数据模型、配置、看门狗、worker 契约、运行状态聚合、分区和编排器。

pub mod config;
pub mod models;
pub mod orchestrator;
pub mod partition;
pub mod planner;
pub mod status;
pub mod watchdog;
pub mod worker;

// Re-exports
pub use models::{RunEvent, RunSummary, StateChange, StatusEvent};
pub use orchestrator::{FileSelector, Orchestrator, Selection};
pub use worker::{WorkerControl, WorkerHandle, WorkerLauncher};
