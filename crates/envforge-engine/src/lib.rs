mod context;
mod engine;
mod fetch;
mod history;
mod interrupt;
mod layout;
mod report;
mod runner;

pub use context::{
    shell_quote, wrap_for_context, CommandLine, ExecutionIdentity, ENV_MODULE, ENV_TARGET_USER,
    ENV_WORKSPACE_ROOT,
};
pub use engine::{Engine, EngineOptions, NoopObserver, RunObserver, DEFAULT_COMMAND_TIMEOUT};
pub use fetch::{HttpFetcher, InstallerFetcher};
pub use history::{read_last_run, read_run_report, write_run_report};
pub use interrupt::InterruptFlag;
pub use layout::{default_staging_root, default_user_root, StateLayout};
pub use report::{
    FailureStage, ModuleFailure, ModuleReport, ModuleState, RunReport, RunStatus,
    ALREADY_SATISFIED, RUN_REPORT_SCHEMA_VERSION,
};
pub use runner::{
    CommandOutcome, CommandRunner, CommandStatus, Invocation, ShellRunner, OUTPUT_TAIL_LINES,
};
