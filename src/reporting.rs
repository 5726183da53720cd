//! # Reporting Module / 报告模块
//!
//! Consumers of the run's event stream: a live console reporter and a JSON summary
//! written after the run.
//!
//! 运行事件流的消费者：实时控制台报告器，以及运行结束后写入的 JSON 摘要。

pub mod console;
pub mod json;

pub use console::ConsoleReporter;
pub use json::write_json_report;
