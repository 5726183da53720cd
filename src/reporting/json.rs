//! # JSON Report Module / JSON 报告模块
//!
//! Writes the finalized run summary as a JSON document, for CI systems and tooling.
//!
//! 将最终的运行摘要写为 JSON 文档，供 CI 系统和工具使用。

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::core::models::RunSummary;

#[derive(Serialize)]
struct JsonReport<'a> {
    exit_code: u8,
    #[serde(flatten)]
    summary: &'a RunSummary,
}

/// Writes `summary` to `path`, creating parent directories as needed.
pub fn write_json_report(summary: &RunSummary, exit_code: u8, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }

    let report = JsonReport { exit_code, summary };
    let contents =
        serde_json::to_string_pretty(&report).context("Failed to serialize JSON report")?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write JSON report: {}", path.display()))
}
