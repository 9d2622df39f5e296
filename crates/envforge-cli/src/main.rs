use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use envforge_core::ReleaseVersion;

mod completion;
mod config;
mod dispatch;
mod render;

use dispatch::{exit_code_for_error, run_cli};
use render::{current_output_style, render_status_line};

const LOG_ENV: &str = "ENVFORGE_LOG";

#[derive(Parser, Debug)]
#[command(name = "envforge", version)]
#[command(about = "Provision a development environment from a module manifest", long_about = None)]
struct Cli {
    /// Module manifest (default: ./envforge.toml)
    #[arg(long, env = "ENVFORGE_MANIFEST", value_name = "PATH", global = true)]
    manifest: Option<PathBuf>,

    /// Pinned installer digests (default: ./checksums.toml)
    #[arg(long, env = "ENVFORGE_CHECKSUMS", value_name = "PATH", global = true)]
    checksums: Option<PathBuf>,

    /// Print the compiled plan as JSON and exit without executing
    #[arg(long, conflicts_with = "list_modules")]
    print_plan: bool,

    #[arg(long)]
    list_modules: bool,

    /// Module id, `tag:<name>`, or `category:<name>`; repeatable
    #[arg(long = "only", value_name = "SELECTOR")]
    only: Vec<String>,

    /// Module id to leave out; repeatable
    #[arg(long = "skip", value_name = "ID")]
    skip: Vec<String>,

    #[arg(long, env = "ENVFORGE_TARGET_VERSION", value_name = "VERSION", value_parser = ReleaseVersion::parse)]
    target_version: Option<ReleaseVersion>,

    #[arg(long)]
    skip_os_upgrade: bool,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, env = "ENVFORGE_COMMAND_TIMEOUT", value_name = "SECS", global = true)]
    command_timeout: Option<u64>,

    /// Leave the reboot between upgrade hops to the operator
    #[arg(long, global = true)]
    no_reboot: bool,

    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Continue an interrupted OS upgrade, then the recorded install
    Resume,
    Status,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run_cli(cli) {
        Ok(exit) => ExitCode::from(exit.code()),
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(current_output_style(), "error", &format!("{err:#}"))
            );
            ExitCode::from(exit_code_for_error(&err).code())
        }
    }
}

fn init_logging(verbose: u8) {
    env_logger::Builder::from_env(
        env_logger::Env::new().filter_or(LOG_ENV, default_log_filter(verbose)),
    )
    .format_timestamp(None)
    .init();
}

fn default_log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}
