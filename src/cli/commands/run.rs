//! # Run Command Module / 运行命令模块
//!
//! This module implements the `run` command: it loads the configuration, applies
//! command-line overrides, wires the orchestrator to the process launcher and the
//! reporters, and turns the run summary into an exit code.
//!
//! 此模块实现了 `run` 命令：加载配置，应用命令行覆盖，将编排器与进程启动器和报告器连接起来，
//! 并将运行摘要转换为退出码。

use anyhow::{Context, Result};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::core::config::{self, DebugConfig, RunConfig};
use crate::core::orchestrator::Orchestrator;
use crate::core::partition::ParallelRun;
use crate::infra::command::ProcessLauncher;
use crate::infra::fs::{DirectorySelector, absolute_path};
use crate::infra::{signal, t};
use crate::reporting::{ConsoleReporter, write_json_report};

/// Name of the configuration file looked up in the project directory.
pub const DEFAULT_CONFIG_FILE: &str = "Runner.toml";

/// Executes the run command and returns the suggested exit code.
///
/// `language` is the explicitly requested locale, if any; it wins over the config.
pub async fn execute(args: RunArgs, language: Option<String>) -> Result<u8> {
    let project_root = absolute_path(&args.project_dir)?;
    let (mut config, config_path) = load_config(args.config.as_deref(), &project_root)?;
    apply_overrides(&mut config, &args)?;
    config.validate()?;

    let locale = match language {
        Some(language) => crate::resolve_locale(Some(&language)),
        None if config_path.is_some() => crate::resolve_locale(Some(&config.language)),
        None => crate::resolve_locale(None),
    };
    rust_i18n::set_locale(&locale);

    if let Some(path) = &config_path {
        println!(
            "{}",
            t!("loading_config", locale = &locale, path = path.display()).dimmed()
        );
    }
    info!(project_root = %project_root.display(), ?config, "resolved configuration");

    let selector = DirectorySelector::new(&project_root, config.files.clone(), args.patterns);
    let launcher = ProcessLauncher::new(config.worker.command.clone());
    let mut orchestrator = Orchestrator::new(
        config,
        &project_root,
        Arc::new(selector),
        Arc::new(launcher),
    );

    let reporter = ConsoleReporter::new(&locale, &project_root);
    let reporter = tokio::spawn(reporter.run(orchestrator.subscribe()));

    let interrupt = CancellationToken::new();
    let signals = signal::cancel_on_signal(interrupt.clone());

    let summary = orchestrator.run(interrupt.clone()).await;

    // Stop listening for signals and let the reporter drain.
    interrupt.cancel();
    drop(orchestrator);
    if let Err(error) = signals.await {
        warn!(%error, "signal listener panicked");
    }
    if let Err(error) = reporter.await {
        warn!(%error, "console reporter panicked");
    }

    let exit_code = summary.suggest_exit_code(!summary.insights.filter.is_empty());

    if let Some(report_path) = &args.json {
        println!(
            "\n{}",
            t!("writing_json_report", locale = &locale, path = report_path.display())
        );
        if let Err(e) = write_json_report(&summary, exit_code, report_path) {
            eprintln!("{} {:#}", t!("json_report_failed", locale = &locale).red(), e);
        }
    }

    if summary.empty_parallel_run {
        // Already announced by the reporter.
    } else if exit_code == 0 {
        println!("\n{}", t!("all_tests_passed", locale = &locale).green().bold());
    } else {
        println!("\n{}", t!("run_failed", locale = &locale).red().bold());
    }

    Ok(exit_code)
}

/// Loads the explicit config file, or `Runner.toml` in the project root when present.
///
/// Returns the configuration and the path it came from, if any.
fn load_config(explicit: Option<&Path>, project_root: &Path) -> Result<(RunConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let path = absolute_path(path)
            .with_context(|| format!("Config file not found: {}", path.display()))?;
        let config = config::load_run_config(&path)?;
        return Ok((config, Some(path)));
    }

    let default_path = project_root.join(DEFAULT_CONFIG_FILE);
    if default_path.is_file() {
        let config = config::load_run_config(&default_path)?;
        return Ok((config, Some(default_path)));
    }

    Ok((RunConfig::default(), None))
}

/// Applies command-line flags on top of the file configuration.
pub fn apply_overrides(config: &mut RunConfig, args: &RunArgs) -> Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.concurrency = Some(concurrency);
    }
    if args.serial {
        config.serial = true;
    }
    if args.fail_fast {
        config.fail_fast = true;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if args.no_cache {
        config.cache = false;
    }
    if args.debug {
        config.debug.get_or_insert_with(DebugConfig::default);
    }
    if let Some(command) = &args.command {
        config.worker.command = command.clone();
    }

    match (args.parallel_index, args.parallel_total) {
        (Some(index), Some(total)) => {
            config.parallel = Some(
                ParallelRun::new(index, total).context("Invalid --parallel-index/--parallel-total")?,
            );
        }
        _ if config.parallel.is_none() => {
            config.parallel = ParallelRun::from_env()
                .context("Invalid CI parallelism environment variables")?;
        }
        _ => {}
    }

    Ok(())
}
