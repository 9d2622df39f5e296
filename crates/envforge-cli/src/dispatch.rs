use anyhow::{Context, Result};
use envforge_core::{ChecksumRegistry, Manifest, ManifestError};
use envforge_engine::{
    default_staging_root, read_last_run, write_run_report, Engine, ExecutionIdentity,
    HttpFetcher, InterruptFlag, RunStatus, ShellRunner, StateLayout,
};
use envforge_planner::{
    compile, validate_all, ExecutionPlan, PlanError, SelectionError, ValidationError,
};
use envforge_upgrade::{
    default_catalog, load_state, lock_holder, SystemDriver, SystemLayout, UpgradeDriver,
    UpgradeError, UpgradeOutcome, UpgradeState, UpgradeStateMachine, SYSTEM_DIR_ENV,
};
use log::{debug, info};
use serde_json::json;

use crate::completion::write_completions_script;
use crate::config::{absolute_path, release_catalog, RunConfig};
use crate::render::{
    current_output_style, format_last_run_lines, format_module_list_lines,
    format_run_outcome_lines, format_upgrade_status_lines, print_lines, print_section,
    render_status_line, OutputStyle, ProgressObserver,
};
use crate::{Cli, Commands};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CliExit {
    Success,
    /// Required module failed, checksum rejected, or any other runtime error.
    Failed,
    /// Manifest or selection rejected before anything ran.
    Invalid,
    /// Upgrade lock held or an upgrade is mid-flight.
    Conflict,
    Interrupted,
}

impl CliExit {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::Invalid => 2,
            Self::Conflict => 3,
            Self::Interrupted => 130,
        }
    }
}

pub(crate) fn run_exit(status: RunStatus) -> CliExit {
    match status {
        RunStatus::Succeeded => CliExit::Success,
        RunStatus::Failed => CliExit::Failed,
        RunStatus::Interrupted => CliExit::Interrupted,
    }
}

pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> CliExit {
    for cause in err.chain() {
        if let Some(upgrade) = cause.downcast_ref::<UpgradeError>() {
            return match upgrade {
                UpgradeError::LockConflict { .. } | UpgradeError::UpgradeInProgress { .. } => {
                    CliExit::Conflict
                }
                _ => CliExit::Failed,
            };
        }
        if cause.is::<PlanError>()
            || cause.is::<SelectionError>()
            || cause.is::<ValidationError>()
            || cause.is::<ManifestError>()
        {
            return CliExit::Invalid;
        }
    }
    CliExit::Failed
}

pub(crate) fn run_cli(cli: Cli) -> Result<CliExit> {
    let style = current_output_style();

    match &cli.command {
        Some(Commands::Completions { shell }) => {
            let mut stdout = std::io::stdout();
            write_completions_script(*shell, &mut stdout)?;
            Ok(CliExit::Success)
        }
        Some(Commands::Resume) => run_resume_command(&RunConfig::from_cli(&cli)?, style),
        Some(Commands::Status) => run_status_command(&RunConfig::from_cli(&cli)?, style),
        None if cli.list_modules => run_list_modules_command(&RunConfig::from_cli(&cli)?),
        None if cli.print_plan => run_print_plan_command(&RunConfig::from_cli(&cli)?, style),
        None => run_install_command(&RunConfig::from_cli(&cli)?, style),
    }
}

fn run_list_modules_command(config: &RunConfig) -> Result<CliExit> {
    let manifest = load_manifest(config)?;
    if config.json {
        let listing = manifest
            .modules
            .iter()
            .map(|module| {
                json!({
                    "id": module.id,
                    "phase": module.phase,
                    "category": module.category(),
                    "run_as": module.run_as,
                    "optional": module.optional,
                    "enabled_by_default": module.enabled_by_default,
                    "tags": module.tags,
                    "dependencies": module.dependencies,
                    "description": module.description,
                })
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        print_lines(&format_module_list_lines(&manifest));
    }
    Ok(CliExit::Success)
}

fn run_print_plan_command(config: &RunConfig, style: OutputStyle) -> Result<CliExit> {
    let manifest = load_manifest(config)?;
    let registry = load_checksums(config)?;
    let plan = validate_and_compile(config, &manifest, &registry, style)?;
    println!("{}", plan.to_json()?);
    Ok(CliExit::Success)
}

fn run_install_command(config: &RunConfig, style: OutputStyle) -> Result<CliExit> {
    let manifest = load_manifest(config)?;
    let registry = load_checksums(config)?;
    let plan = validate_and_compile(config, &manifest, &registry, style)?;
    info!(
        "plan compiled: modules={} mode={}",
        plan.len(),
        plan.mode.as_str()
    );

    if let Some(exit) = run_upgrade_phase(config, &manifest, style)? {
        return Ok(exit);
    }
    execute_plan(config, &manifest, &registry, &plan, style)
}

fn run_resume_command(config: &RunConfig, style: OutputStyle) -> Result<CliExit> {
    let layout = SystemLayout::new(&config.system_root);
    // The catalog is re-read from the recorded manifest when it is still there.
    let catalog = load_state(&layout)?
        .and_then(|state| state.install_request)
        .and_then(|request| request.manifest)
        .and_then(|path| Manifest::load(&path).ok())
        .map(|manifest| release_catalog(&manifest))
        .unwrap_or_else(default_catalog);
    let mut machine = UpgradeStateMachine::new(layout, system_driver(config)?, catalog);

    print_section(style, "os upgrade");
    match machine.resume()? {
        UpgradeOutcome::NothingToResume => {
            notice(config, style, "ok", "no upgrade to resume");
            Ok(CliExit::Success)
        }
        UpgradeOutcome::AlreadyAtTarget { current } => {
            notice(config, style, "ok", &format!("system already at {current}"));
            Ok(CliExit::Success)
        }
        UpgradeOutcome::AwaitingReboot(state) => await_reboot(config, &mut machine, &state, style),
        UpgradeOutcome::Completed { state, archived } => {
            notice(
                config,
                style,
                "ok",
                &format!(
                    "upgrade to {} completed (state archived to {})",
                    state.current_version,
                    archived.display()
                ),
            );
            match &state.install_request {
                Some(request) => run_install_command(&config.for_recorded_install(request), style),
                None => Ok(CliExit::Success),
            }
        }
    }
}

fn run_status_command(config: &RunConfig, style: OutputStyle) -> Result<CliExit> {
    let system = SystemLayout::new(&config.system_root);
    let upgrade = load_state(&system)?;
    let lock_pid = lock_holder(&system.lock_path());
    let last_run = read_last_run(&StateLayout::new(config.resolve_user_root()?))?;

    if config.json {
        let status = json!({
            "upgrade": upgrade,
            "upgrade_lock_pid": lock_pid,
            "last_run": last_run,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(CliExit::Success);
    }

    print_section(style, "os upgrade");
    print_lines(&format_upgrade_status_lines(upgrade.as_ref(), lock_pid));
    print_section(style, "last run");
    print_lines(&format_last_run_lines(last_run.as_ref()));
    Ok(CliExit::Success)
}

/// Returns an exit when the upgrade has to stop the process here.
fn run_upgrade_phase(
    config: &RunConfig,
    manifest: &Manifest,
    style: OutputStyle,
) -> Result<Option<CliExit>> {
    let layout = SystemLayout::new(&config.system_root);
    let Some(target) = config.upgrade_target(manifest) else {
        if !config.skip_os_upgrade {
            ensure_no_upgrade_in_progress(&layout)?;
        }
        return Ok(None);
    };

    let target_user = config.target_user(manifest, &ExecutionIdentity::current()).ok();
    let install_request = config.install_request(target_user)?;
    let mut machine =
        UpgradeStateMachine::new(layout, system_driver(config)?, release_catalog(manifest));
    print_section(style, "os upgrade");
    match machine.start(target, Some(install_request))? {
        UpgradeOutcome::AlreadyAtTarget { current } => {
            notice(
                config,
                style,
                "ok",
                &format!("system already at {current} (target {target})"),
            );
            Ok(None)
        }
        UpgradeOutcome::AwaitingReboot(state) => {
            await_reboot(config, &mut machine, &state, style).map(Some)
        }
        UpgradeOutcome::Completed { state, .. } => {
            notice(
                config,
                style,
                "ok",
                &format!("upgrade to {} completed", state.current_version),
            );
            Ok(None)
        }
        UpgradeOutcome::NothingToResume => Ok(None),
    }
}

fn ensure_no_upgrade_in_progress(layout: &SystemLayout) -> Result<()> {
    match load_state(layout)? {
        Some(state) if !state.is_finished() => Err(UpgradeError::UpgradeInProgress {
            stage: state.stage,
            current: state.current_version,
            target: state.target_version,
        }
        .into()),
        _ => Ok(()),
    }
}

fn await_reboot<D: UpgradeDriver>(
    config: &RunConfig,
    machine: &mut UpgradeStateMachine<D>,
    state: &UpgradeState,
    style: OutputStyle,
) -> Result<CliExit> {
    notice(
        config,
        style,
        "ok",
        &format!(
            "upgraded to {} (target {})",
            state.current_version, state.target_version
        ),
    );
    if !config.reboot {
        notice(
            config,
            style,
            "warn",
            "reboot required; envforge resumes automatically after boot (or run `envforge resume`)",
        );
        return Ok(CliExit::Success);
    }

    notice(config, style, "step", "rebooting to continue the upgrade");
    machine.driver_mut().reboot()?;
    Ok(CliExit::Success)
}

fn execute_plan(
    config: &RunConfig,
    manifest: &Manifest,
    registry: &ChecksumRegistry,
    plan: &ExecutionPlan,
    style: OutputStyle,
) -> Result<CliExit> {
    let layout = StateLayout::new(config.resolve_user_root()?);
    layout.ensure_base_dirs()?;

    let interrupt = InterruptFlag::with_signal_handlers();
    let options =
        config.engine_options(manifest, ExecutionIdentity::current(), default_staging_root())?;
    debug!(
        "engine options: target_user={} workspace_root={} timeout={}s",
        options.target_user,
        options.workspace_root.display(),
        options.command_timeout.as_secs()
    );
    let mut engine = Engine::new(
        ShellRunner::new(interrupt.clone()),
        HttpFetcher::new()?,
        options,
        interrupt,
    );

    print_section(style, "modules");
    let mut observer = ProgressObserver::new(style, config.json);
    let report = engine.run_with_observer(plan, manifest, registry, &mut observer);
    observer.finish();

    match write_run_report(&layout, &report) {
        Ok(path) => debug!("run report written: {}", path.display()),
        Err(err) => eprintln!(
            "{}",
            render_status_line(
                style,
                "warn",
                &format!("run report not saved (reason={err:#})")
            )
        ),
    }

    if config.json {
        println!("{}", report.to_json()?);
    } else {
        print_lines(&format_run_outcome_lines(&report, style));
    }
    Ok(run_exit(report.status))
}

fn load_manifest(config: &RunConfig) -> Result<Manifest> {
    Manifest::load(&config.manifest_path).with_context(|| {
        format!(
            "failed to load manifest: {}",
            config.manifest_path.display()
        )
    })
}

fn load_checksums(config: &RunConfig) -> Result<ChecksumRegistry> {
    if !config.checksums_explicit && !config.checksums_path.exists() {
        debug!(
            "no checksum registry at {}; verified installers will be rejected",
            config.checksums_path.display()
        );
        return Ok(ChecksumRegistry::default());
    }
    ChecksumRegistry::load(&config.checksums_path).with_context(|| {
        format!(
            "failed to load checksum registry: {}",
            config.checksums_path.display()
        )
    })
}

/// Every validation error is reported, not just the first.
fn validate_and_compile(
    config: &RunConfig,
    manifest: &Manifest,
    registry: &ChecksumRegistry,
    style: OutputStyle,
) -> Result<ExecutionPlan> {
    let errors = validate_all(manifest, registry);
    if !errors.is_empty() {
        if config.json {
            println!("{}", serde_json::to_string_pretty(&errors)?);
        } else {
            for error in &errors {
                eprintln!("{}", render_status_line(style, "error", &error.to_string()));
            }
        }
        return Err(PlanError::Invalid(errors).into());
    }
    Ok(compile(manifest, &config.selection())?)
}

/// The boot-time resume unit gets no environment of its own, so the state
/// dir this invocation used is written into it.
fn system_driver(config: &RunConfig) -> Result<SystemDriver> {
    let exe = std::env::current_exe().context("failed to resolve envforge executable path")?;
    let system_root = absolute_path(&config.system_root)?;
    Ok(SystemDriver::new(exe)
        .with_resume_env(SYSTEM_DIR_ENV, system_root.to_string_lossy().into_owned()))
}

/// Progress text stays off stdout when it carries JSON.
fn notice(config: &RunConfig, style: OutputStyle, status: &str, message: &str) {
    let line = render_status_line(style, status, message);
    if config.json {
        eprintln!("{line}");
    } else {
        println!("{line}");
    }
}
