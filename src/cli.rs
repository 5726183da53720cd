//! # Command-Line Interface Module / 命令行接口模块
//!
//! Builds the `isorun` command line with clap and dispatches to the subcommands.
//! Help texts are localized, so the language is determined before clap runs.
//!
//! 使用 clap 构建 `isorun` 命令行并分派到子命令。帮助文本已本地化，因此在 clap 运行之前确定语言。

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::{env, path::PathBuf};

use crate::infra::{logger, t};

pub mod commands {
    pub mod run;
}

/// Everything the `run` subcommand accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    pub patterns: Vec<String>,
    pub config: Option<PathBuf>,
    pub project_dir: PathBuf,
    pub concurrency: Option<usize>,
    pub serial: bool,
    pub fail_fast: bool,
    pub timeout_ms: Option<u64>,
    pub no_cache: bool,
    pub debug: bool,
    pub parallel_index: Option<usize>,
    pub parallel_total: Option<usize>,
    pub command: Option<String>,
    pub json: Option<PathBuf>,
    pub verbose: bool,
}

impl RunArgs {
    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            patterns: matches
                .get_many::<String>("patterns")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            config: matches.get_one::<PathBuf>("config").cloned(),
            project_dir: matches
                .get_one::<PathBuf>("project-dir")
                .cloned()
                .unwrap_or_else(|| PathBuf::from(".")),
            concurrency: matches.get_one::<usize>("concurrency").copied(),
            serial: matches.get_flag("serial"),
            fail_fast: matches.get_flag("fail-fast"),
            timeout_ms: matches.get_one::<u64>("timeout").copied(),
            no_cache: matches.get_flag("no-cache"),
            debug: matches.get_flag("debug"),
            parallel_index: matches.get_one::<usize>("parallel-index").copied(),
            parallel_total: matches.get_one::<usize>("parallel-total").copied(),
            command: matches.get_one::<String>("command").cloned(),
            json: matches.get_one::<PathBuf>("json").cloned(),
            verbose: matches.get_flag("verbose"),
        }
    }
}

/// Pre-parses the command line arguments to find the language setting.
/// This allows i18n to be initialized before the full CLI is built.
/// It looks for a `--lang <VALUE>` argument.
fn pre_parse_language() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    let pos = args.iter().position(|arg| arg == "--lang")?;
    args.get(pos + 1).cloned()
}

fn flag(name: &'static str, help: String) -> Arg {
    Arg::new(name).long(name).help(help).action(ArgAction::SetTrue)
}

pub fn build_cli(locale: &str) -> Command {
    Command::new("isorun")
        .version(env!("CARGO_PKG_VERSION"))
        .about(t!("cli_about", locale = locale).to_string())
        .arg(
            Arg::new("lang")
                .long("lang")
                .help(t!("cli_lang", locale = locale).to_string())
                .value_name("LANGUAGE")
                .global(true)
                .action(ArgAction::Set),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about(t!("cmd_run_about", locale = locale).to_string())
                .arg(
                    Arg::new("patterns")
                        .help(t!("arg_patterns", locale = locale).to_string())
                        .value_name("PATTERNS")
                        .num_args(0..)
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .help(t!("arg_config", locale = locale).to_string())
                        .value_name("CONFIG")
                        .value_parser(clap::value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("project-dir")
                        .long("project-dir")
                        .help(t!("arg_project_dir", locale = locale).to_string())
                        .value_name("PROJECT_DIR")
                        .default_value(".")
                        .value_parser(clap::value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("concurrency")
                        .short('j')
                        .long("concurrency")
                        .help(t!("arg_concurrency", locale = locale).to_string())
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .action(ArgAction::Set),
                )
                .arg(flag("serial", t!("arg_serial", locale = locale).to_string()))
                .arg(flag("fail-fast", t!("arg_fail_fast", locale = locale).to_string()))
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .help(t!("arg_timeout", locale = locale).to_string())
                        .value_name("MS")
                        .value_parser(clap::value_parser!(u64))
                        .action(ArgAction::Set),
                )
                .arg(flag("no-cache", t!("arg_no_cache", locale = locale).to_string()))
                .arg(flag("debug", t!("arg_debug", locale = locale).to_string()))
                .arg(
                    Arg::new("parallel-index")
                        .long("parallel-index")
                        .help(t!("arg_parallel_index", locale = locale).to_string())
                        .value_name("INDEX")
                        .value_parser(clap::value_parser!(usize))
                        .action(ArgAction::Set)
                        .requires("parallel-total"),
                )
                .arg(
                    Arg::new("parallel-total")
                        .long("parallel-total")
                        .help(t!("arg_parallel_total", locale = locale).to_string())
                        .value_name("TOTAL")
                        .value_parser(clap::value_parser!(usize))
                        .action(ArgAction::Set)
                        .requires("parallel-index"),
                )
                .arg(
                    Arg::new("command")
                        .long("command")
                        .help(t!("arg_command", locale = locale).to_string())
                        .value_name("COMMAND")
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .help(t!("arg_json", locale = locale).to_string())
                        .value_name("PATH")
                        .value_parser(clap::value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .help(t!("arg_verbose", locale = locale).to_string())
                        .action(ArgAction::SetTrue),
                ),
        )
}

/// Parses the command line and runs the chosen subcommand. Returns the process exit code.
pub async fn run() -> Result<u8> {
    // Pre-parse language and initialize i18n first.
    let requested = pre_parse_language();
    let language = crate::resolve_locale(requested.as_deref());
    rust_i18n::set_locale(&language);

    let matches = build_cli(&language).get_matches();

    match matches.subcommand() {
        Some(("run", run_matches)) => {
            let args = RunArgs::from_matches(run_matches);
            logger::init_logger(args.verbose);
            commands::run::execute(args, requested).await
        }
        // `subcommand_required` makes clap exit before we get here.
        _ => Ok(2),
    }
}
