//! # Console Reporting Module / 控制台报告模块
//!
//! Prints the run's event stream as it happens: one line per test result, worker
//! problems, timeouts and interrupts, and a colored summary once the final `stats`
//! event arrives. All messages are localized.
//!
//! 实时打印运行的事件流：每个测试结果一行、worker 问题、超时和中断，
//! 并在最终的 `stats` 事件到达时打印彩色摘要。所有消息均已本地化。

use colored::*;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::core::models::{PendingTests, RunEvent, RunPlan, StateChange, Stats, StatusEvent};
use crate::infra::t;

/// A reporter that writes to stdout (results) and stderr (worker passthrough).
///
/// 一个写入 stdout（结果）和 stderr（worker 透传输出）的报告器。
pub struct ConsoleReporter {
    locale: String,
    project_root: PathBuf,
    plan: Option<RunPlan>,
}

impl ConsoleReporter {
    pub fn new(locale: impl Into<String>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            locale: locale.into(),
            project_root: project_root.into(),
            plan: None,
        }
    }

    /// Consumes events until the final `stats` event, or until the stream closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RunEvent>) {
        while let Some(event) = events.recv().await {
            let done = matches!(
                &event,
                RunEvent::StateChange(StatusEvent {
                    change: StateChange::Stats { .. },
                    ..
                })
            );
            self.handle(&event);
            if done {
                break;
            }
        }
    }

    pub fn handle(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Run(plan) => {
                self.print_plan(plan);
                self.plan = Some((**plan).clone());
            }
            RunEvent::StateChange(event) => self.print_change(event),
        }
    }

    fn display(&self, file: Option<&Path>) -> String {
        match file {
            Some(file) => file
                .strip_prefix(&self.project_root)
                .unwrap_or(file)
                .display()
                .to_string(),
            None => String::new(),
        }
    }

    fn print_plan(&self, plan: &RunPlan) {
        let locale = self.locale.as_str();

        if let Some(info) = plan.parallel_run {
            println!(
                "{}",
                t!(
                    "running_as_split_runner",
                    locale = locale,
                    index = info.current_index + 1,
                    total = info.total_runs,
                    count = info.current_file_count
                )
                .bold()
            );
        }
        if plan.empty_parallel_run {
            println!("{}", t!("empty_parallel_run", locale = locale).yellow());
            return;
        }
        if plan.debug && plan.files.len() > 1 {
            println!(
                "{}",
                t!("debug_requires_single_file", locale = locale, count = plan.files.len()).red()
            );
            return;
        }
        if plan.files.is_empty() {
            println!("{}", t!("no_files_to_run", locale = locale).yellow());
            return;
        }

        println!(
            "{}",
            t!(
                "starting_run",
                locale = locale,
                count = plan.files.len(),
                concurrency = plan.concurrency
            )
            .cyan()
        );
        if plan.previous_failures > 0 {
            println!(
                "{}",
                t!("previous_failures_first", locale = locale, count = plan.previous_failures)
                    .yellow()
            );
        }
        if plan.fail_fast {
            println!("{}", t!("fail_fast_enabled", locale = locale).dimmed());
        }
    }

    fn print_change(&self, event: &StatusEvent) {
        let locale = self.locale.as_str();
        let file = self.display(event.file());

        match &event.change {
            StateChange::DeclaredTest { .. } | StateChange::TestTimeoutConfigured { .. } => {}
            StateChange::SelectedTest { title, skip, todo } => {
                if *skip {
                    println!("  {} {} › {}", "-".yellow(), file, title.dimmed());
                } else if *todo {
                    println!("  {} {} › {}", "-".blue(), file, title.dimmed());
                }
            }
            StateChange::TestPassed {
                title,
                duration_ms,
                known_failing,
            } => {
                let mark = if *known_failing { "✔".yellow() } else { "✔".green() };
                println!("  {mark} {file} › {title} {}", format!("({duration_ms}ms)").dimmed());
            }
            StateChange::TestFailed { title, message, .. } => {
                println!("  {} {} › {}", "✘".red(), file, title.red());
                if let Some(message) = message {
                    println!("{}", indent(message));
                }
            }
            StateChange::HookFailed { title, message } => {
                println!(
                    "  {} {}",
                    "✘".red(),
                    t!("hook_failed", locale = locale, file = file, title = title).red()
                );
                if let Some(message) = message {
                    println!("{}", indent(message));
                }
            }
            StateChange::UncaughtException { message } => {
                println!(
                    "  {} {}",
                    "✘".red(),
                    t!("uncaught_exception", locale = locale, file = file).red()
                );
                println!("{}", indent(message));
            }
            StateChange::UnhandledRejection { message } => {
                println!(
                    "  {} {}",
                    "✘".red(),
                    t!("unhandled_rejection", locale = locale, file = file).red()
                );
                println!("{}", indent(message));
            }
            StateChange::WorkerStdout { chunk } | StateChange::WorkerStderr { chunk } => {
                eprint!("{chunk}");
            }
            StateChange::WorkerFinished { forced_exit } => {
                if *forced_exit {
                    println!(
                        "  {} {}",
                        "!".yellow(),
                        t!("worker_forced_exit", locale = locale, file = file).yellow()
                    );
                }
            }
            StateChange::WorkerFailed {
                exit_code,
                signal,
                message,
            } => {
                let reason = match (exit_code, signal, message) {
                    (_, _, Some(message)) => message.clone(),
                    (Some(code), _, None) => {
                        t!("worker_exit_code", locale = locale, code = code).to_string()
                    }
                    (None, Some(signal), None) => {
                        t!("worker_signal", locale = locale, signal = signal).to_string()
                    }
                    (None, None, None) => t!("worker_unknown_exit", locale = locale).to_string(),
                };
                println!(
                    "  {} {}",
                    "✘".red(),
                    t!("worker_failed", locale = locale, file = file, reason = reason).red()
                );
            }
            StateChange::Timeout {
                period_ms,
                pending_tests,
            } => {
                println!(
                    "\n{}",
                    t!("timed_out", locale = locale, period = period_ms).red().bold()
                );
                self.print_pending(pending_tests);
            }
            StateChange::Interrupt { pending_tests } => {
                println!("\n{}", t!("interrupted", locale = locale).yellow().bold());
                self.print_pending(pending_tests);
            }
            StateChange::InternalError { message } => {
                let scope = if file.is_empty() {
                    t!("internal_error", locale = locale).to_string()
                } else {
                    t!("internal_error_in_file", locale = locale, file = file).to_string()
                };
                println!("  {} {}", "✘".red(), scope.red().bold());
                println!("{}", indent(message));
            }
            StateChange::TouchedFiles { .. } => {}
            StateChange::Stats { stats } => self.print_summary(stats),
        }
    }

    fn print_pending(&self, pending: &PendingTests) {
        for (file, titles) in pending {
            let file = self.display(Some(file));
            for title in titles {
                println!("  {} {} › {}", "◌".dimmed(), file, title);
            }
        }
    }

    /// Prints a formatted summary of the run to the console.
    ///
    /// 在控制台打印格式化的运行摘要。
    fn print_summary(&self, stats: &Stats) {
        let locale = self.locale.as_str();
        println!("\n{}", t!("summary_banner", locale = locale).bold());

        let counters: [(&str, usize, Color); 10] = [
            ("summary_passed", stats.passed_tests, Color::Green),
            ("summary_known_failing", stats.passed_known_failing_tests, Color::Yellow),
            ("summary_failed", stats.failed_tests, Color::Red),
            ("summary_skipped", stats.skipped_tests, Color::Yellow),
            ("summary_todo", stats.todo_tests, Color::Blue),
            ("summary_failed_hooks", stats.failed_hooks, Color::Red),
            ("summary_uncaught", stats.uncaught_exceptions, Color::Red),
            ("summary_rejections", stats.unhandled_rejections, Color::Red),
            ("summary_failed_workers", stats.failed_workers, Color::Red),
            ("summary_timed_out_tests", stats.timed_out_tests, Color::Red),
        ];
        for (key, count, color) in counters {
            if count == 0 && key != "summary_passed" && key != "summary_failed" {
                continue;
            }
            let label = t!(key, locale = locale).to_string();
            println!("  - {:<24} {}", label, count.to_string().color(color));
        }

        if let Some(plan) = &self.plan {
            let not_run = plan.files.len().saturating_sub(stats.terminated_workers());
            if plan.fail_fast && not_run > 0 && !stats.interrupted {
                println!(
                    "\n{}",
                    t!("files_not_run_fail_fast", locale = locale, count = not_run).yellow()
                );
            }
        }

        if stats.internal_errors > 0 {
            println!(
                "\n{}",
                t!("summary_internal_errors", locale = locale, count = stats.internal_errors).red()
            );
        }
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
