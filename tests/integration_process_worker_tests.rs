//! # Process Worker Integration Tests / 进程 Worker 集成测试
//!
//! Runs real `sh` scripts as test files through the orchestrator, the directory
//! selector and the process launcher.
//!
//! 通过编排器、目录选择器和进程启动器将真实的 `sh` 脚本作为测试文件运行。

#![cfg(unix)]

mod common;

use isorun::config::{FilesConfig, RunConfig};
use isorun::core::models::{RunEvent, RunSummary, StateChange};
use isorun::core::orchestrator::{FileSelector, HostInfo, Orchestrator};
use isorun::infra::command::{ProcessLauncher, build_command_line};
use isorun::infra::fs::DirectorySelector;
use isorun::reporting::write_json_report;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

const PASSING_SCRIPT: &str = r#"
echo '@@isorun {"type":"declared-test","title":"adds"}'
echo '@@isorun {"type":"selected-test","title":"adds"}'
echo '@@isorun {"type":"test-passed","title":"adds","duration_ms":2}'
echo "plain output"
echo "to stderr" >&2
"#;

/// A project directory with a `tests/` folder.
fn project(scripts: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    for (name, body) in scripts {
        let path = root.join("tests").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }
    (dir, root)
}

fn sh_config(concurrency: usize) -> RunConfig {
    let mut config = common::test_config(concurrency);
    config.worker.command = "sh {file}".to_string();
    config
}

fn orchestrator(config: RunConfig, root: &Path) -> Orchestrator {
    let selector = DirectorySelector::new(root, config.files.clone(), Vec::new());
    let launcher = ProcessLauncher::new(config.worker.command.clone());
    Orchestrator::new(config, root, Arc::new(selector), Arc::new(launcher)).with_host(HostInfo {
        is_ci: false,
        logical_cpus: 2,
    })
}

async fn run(config: RunConfig, root: &Path) -> (RunSummary, Vec<RunEvent>) {
    let mut orchestrator = orchestrator(config, root);
    let mut rx = orchestrator.subscribe();
    let summary = orchestrator.run(CancellationToken::new()).await;
    (summary, common::drain(&mut rx))
}

fn changes_of<'a>(events: &'a [RunEvent], file: &Path) -> Vec<&'a StateChange> {
    common::changes(events)
        .into_iter()
        .filter(|event| event.file() == Some(file))
        .map(|event| &event.change)
        .collect()
}

fn stdout_of(events: &[RunEvent], file: &Path) -> String {
    changes_of(events, file)
        .into_iter()
        .filter_map(|change| match change {
            StateChange::WorkerStdout { chunk } => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod protocol_tests {
    use super::*;

    #[tokio::test]
    async fn test_events_and_output_are_forwarded() {
        let (_dir, root) = project(&[("adds.sh", PASSING_SCRIPT)]);
        let (summary, events) = run(sh_config(1), &root).await;

        let file = root.join("tests/adds.sh");
        let changes = changes_of(&events, &file);
        assert!(changes.contains(&&StateChange::TestPassed {
            title: "adds".to_string(),
            duration_ms: 2,
            known_failing: false,
        }));
        assert!(changes.contains(&&StateChange::WorkerStdout {
            chunk: "plain output\n".to_string(),
        }));
        assert!(changes.contains(&&StateChange::WorkerStderr {
            chunk: "to stderr\n".to_string(),
        }));
        assert_eq!(
            changes.last(),
            Some(&&StateChange::WorkerFinished { forced_exit: false })
        );

        assert_eq!(summary.stats.declared_tests, 1);
        assert_eq!(summary.stats.passed_tests, 1);
        assert_eq!(summary.suggest_exit_code(false), 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_failed_worker() {
        let (_dir, root) = project(&[("crash.sh", "exit 3\n")]);
        let (summary, events) = run(sh_config(1), &root).await;

        let changes = changes_of(&events, &root.join("tests/crash.sh"));
        assert_eq!(
            changes.last(),
            Some(&&StateChange::WorkerFailed {
                exit_code: Some(3),
                signal: None,
                message: None,
            })
        );
        assert_eq!(summary.stats.failed_workers, 1);
        assert_eq!(summary.suggest_exit_code(false), 1);
    }

    #[tokio::test]
    async fn test_invalid_event_line_is_an_internal_error() {
        let (_dir, root) = project(&[("broken.sh", "echo '@@isorun {not json'\n")]);
        let (summary, events) = run(sh_config(1), &root).await;

        let changes = changes_of(&events, &root.join("tests/broken.sh"));
        assert!(changes
            .iter()
            .any(|change| matches!(change, StateChange::InternalError { message } if message.contains("{not json"))));
        assert_eq!(summary.stats.internal_errors, 1);
        assert_eq!(summary.stats.by_file[&root.join("tests/broken.sh")].internal_errors, 1);
    }

    #[tokio::test]
    async fn test_worker_environment() {
        let script = r#"
echo "file=$ISORUN_TEST_FILE"
echo "fail_fast=$ISORUN_FAIL_FAST"
echo "greeting=$GREETING"
echo "scratch=$TMPDIR"
"#;
        let (_dir, root) = project(&[("env.sh", script)]);
        let mut config = sh_config(1);
        config.fail_fast = true;
        config.worker.env.insert("GREETING".to_string(), "hello".to_string());

        let (_summary, events) = run(config, &root).await;
        let file = root.join("tests/env.sh");
        let output = stdout_of(&events, &file);

        assert!(output.contains(&format!("file={}\n", file.display())));
        assert!(output.contains("fail_fast=1\n"));
        assert!(output.contains("greeting=hello\n"));

        let scratch = output
            .lines()
            .find_map(|line| line.strip_prefix("scratch="))
            .unwrap();
        assert!(!scratch.is_empty());
        assert!(
            !Path::new(scratch).exists(),
            "scratch directories are removed once the run drained"
        );
    }
}

#[cfg(test)]
mod control_tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_timeout_stops_a_hanging_worker() {
        let (_dir, root) = project(&[("hang.sh", "exec sleep 30\n")]);
        let mut config = sh_config(1);
        config.timeout_ms = 200;

        let (summary, events) = tokio::time::timeout(Duration::from_secs(10), run(config, &root))
            .await
            .expect("the watchdog should end the run");

        assert!(common::changes(&events)
            .iter()
            .any(|event| matches!(event.change, StateChange::Timeout { period_ms: 200, .. })));
        assert_eq!(
            changes_of(&events, &root.join("tests/hang.sh")).last(),
            Some(&&StateChange::WorkerFinished { forced_exit: true })
        );
        assert_eq!(summary.stats.timeouts, 1);
        assert_eq!(summary.suggest_exit_code(false), 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_does_not_wait_for_leftover_processes() {
        let (_dir, root) = project(&[("orphan.sh", "sleep 6 &\nexit 0\n")]);
        let mut config = sh_config(1);
        config.timeout_ms = 200;

        let started = std::time::Instant::now();
        let (summary, events) = tokio::time::timeout(Duration::from_secs(4), run(config, &root))
            .await
            .expect("a forced exit must not wait for the leftover process");

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(
            changes_of(&events, &root.join("tests/orphan.sh")).last(),
            Some(&&StateChange::WorkerFinished { forced_exit: true })
        );
        assert_eq!(summary.stats.timeouts, 1);
    }

    #[tokio::test]
    async fn test_peer_failure_is_written_to_stdin() {
        let (_dir, root) = project(&[
            ("a_fails.sh", "sleep 0.2\nexit 1\n"),
            ("b_listens.sh", "read line\necho \"got: $line\"\n"),
        ]);
        let mut config = sh_config(2);
        config.fail_fast = true;

        let (summary, events) = tokio::time::timeout(Duration::from_secs(10), run(config, &root))
            .await
            .expect("the listener exits after the notice");

        let output = stdout_of(&events, &root.join("tests/b_listens.sh"));
        assert_eq!(output, "got: {\"type\":\"peer-failed\"}\n");
        assert_eq!(summary.stats.failed_workers, 1);
        assert_eq!(summary.stats.finished_workers, 1);
    }

    #[tokio::test]
    async fn test_interrupt_stops_running_workers() {
        let (_dir, root) = project(&[("hang.sh", "exec sleep 30\n")]);
        let mut orchestrator = orchestrator(sh_config(1), &root);
        let mut rx = orchestrator.subscribe();

        let interrupt = CancellationToken::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let summary = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(interrupt))
            .await
            .expect("the interrupt should end the run");
        let events = common::drain(&mut rx);

        assert!(summary.stats.interrupted);
        assert_eq!(
            changes_of(&events, &root.join("tests/hang.sh")).last(),
            Some(&&StateChange::WorkerFinished { forced_exit: true })
        );
        assert_eq!(summary.suggest_exit_code(false), 1);
    }

    #[tokio::test]
    async fn test_missing_program_fails_the_file() {
        let (_dir, root) = project(&[("a.sh", "exit 0\n")]);
        let mut config = sh_config(1);
        config.worker.command = "isorun-no-such-interpreter {file}".to_string();

        let (summary, events) = run(config, &root).await;
        let changes = changes_of(&events, &root.join("tests/a.sh"));

        assert!(matches!(
            changes.last(),
            Some(StateChange::WorkerFailed { message: Some(message), .. })
                if message.contains("isorun-no-such-interpreter")
        ));
        assert_eq!(summary.stats.failed_workers, 1);
    }
}

#[cfg(test)]
mod command_line_tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_placeholder_is_substituted() {
        let (program, args) =
            build_command_line("node --test {file} --reporter=tap", Path::new("t/a.js"), &[])
                .unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, strings(&["--test", "t/a.js", "--reporter=tap"]));
    }

    #[test]
    fn test_file_is_appended_without_placeholder() {
        let (program, args) = build_command_line("python -m runner", Path::new("a.py"), &[]).unwrap();
        assert_eq!(program, "python");
        assert_eq!(args, strings(&["-m", "runner", "a.py"]));
    }

    #[test]
    fn test_interpreter_args_follow_the_program() {
        let (_, args) = build_command_line(
            "node {file}",
            Path::new("a.js"),
            &strings(&["--inspect-brk", "--enable-source-maps"]),
        )
        .unwrap();
        assert_eq!(args, strings(&["--inspect-brk", "--enable-source-maps", "a.js"]));
    }

    #[test]
    fn test_quotes_are_respected() {
        let (_, args) =
            build_command_line(r#"sh -c 'run "$0"' {file}"#, Path::new("a b.sh"), &[]).unwrap();
        assert_eq!(args, strings(&["-c", r#"run "$0""#, "a b.sh"]));
    }

    #[test]
    fn test_variables_expand_per_argument() {
        let home = std::env::var("HOME").unwrap();
        let (program, args) = build_command_line(
            "$HOME/bin/run $ISORUN_UNSET_VARIABLE {file}",
            Path::new("a.js"),
            &[],
        )
        .unwrap();
        assert_eq!(program, format!("{home}/bin/run"));
        assert_eq!(args, strings(&["$ISORUN_UNSET_VARIABLE", "a.js"]));
    }

    #[test]
    fn test_invalid_templates() {
        assert!(build_command_line("node 'unterminated", Path::new("a.js"), &[]).is_err());
        assert!(build_command_line("   ", Path::new("a.js"), &[]).is_err());
    }
}

#[cfg(test)]
mod selector_tests {
    use super::*;

    fn files_config(extensions: &[&str], ignore: &[&str]) -> FilesConfig {
        FilesConfig {
            extensions: extensions.iter().map(|ext| ext.to_string()).collect(),
            ignore: ignore.iter().map(|needle| needle.to_string()).collect(),
            ..FilesConfig::default()
        }
    }

    fn tree() -> (TempDir, PathBuf) {
        project(&[
            ("math/add.test.js", ""),
            ("math/sub.test.js", ""),
            ("math/.snapshots/add.test.js", ""),
            ("math/deep/er/mul.test.js", ""),
            ("strings.test.js", ""),
            ("fixtures/data.test.js", ""),
            ("helpers.py", ""),
            (".hidden.test.js", ""),
            (".cache/stale.test.js", ""),
        ])
    }

    #[test]
    fn test_walks_roots_with_extension_and_ignore_filters() {
        let (_dir, root) = tree();
        let selector = DirectorySelector::new(&root, files_config(&["js"], &["fixtures"]), Vec::new());
        let selection = selector.select().unwrap();

        assert_eq!(
            selection.files,
            vec![
                root.join("tests/math/add.test.js"),
                root.join("tests/math/deep/er/mul.test.js"),
                root.join("tests/math/sub.test.js"),
                root.join("tests/strings.test.js"),
            ]
        );
        assert_eq!(selection.insights.ignored_files, 1);
        assert_eq!(selection.insights.test_file_count, 4);
        assert_eq!(selection.insights.selection_count, 4);
        assert!(selection.insights.filter.is_empty());
    }

    #[test]
    fn test_patterns_filter_by_substring_or_name_a_file() {
        let (_dir, root) = tree();
        let patterns = vec!["math/".to_string(), "tests/helpers.py".to_string()];
        let selector = DirectorySelector::new(&root, files_config(&["js"], &[]), patterns.clone());
        let selection = selector.select().unwrap();

        assert_eq!(
            selection.files,
            vec![
                root.join("tests/helpers.py"),
                root.join("tests/math/add.test.js"),
                root.join("tests/math/deep/er/mul.test.js"),
                root.join("tests/math/sub.test.js"),
            ]
        );
        assert_eq!(selection.insights.filter, patterns);
        assert_eq!(selection.insights.selection_count, 4);
    }

    #[test]
    fn test_a_root_may_be_a_file_and_missing_roots_are_skipped() {
        let (_dir, root) = tree();
        let files = FilesConfig {
            roots: vec![PathBuf::from("tests/strings.test.js"), PathBuf::from("nowhere")],
            ..FilesConfig::default()
        };
        let selection = DirectorySelector::new(&root, files, Vec::new()).select().unwrap();
        assert_eq!(selection.files, vec![root.join("tests/strings.test.js")]);
    }
}

#[cfg(test)]
mod json_report_tests {
    use super::*;

    #[tokio::test]
    async fn test_report_contains_exit_code_and_stats() {
        let (_dir, root) = project(&[("adds.sh", PASSING_SCRIPT), ("crash.sh", "exit 2\n")]);
        let (summary, _events) = run(sh_config(2), &root).await;
        let exit_code = summary.suggest_exit_code(false);

        let report_path = root.join("reports/nested/run.json");
        write_json_report(&summary, exit_code, &report_path).unwrap();

        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(report["exit_code"], 1);
        assert_eq!(report["stats"]["passed_tests"], 1);
        assert_eq!(report["stats"]["failed_workers"], 1);
        assert_eq!(report["empty_parallel_run"], false);
    }
}
