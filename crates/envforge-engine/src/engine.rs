use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use envforge_core::{
    current_unix_timestamp, remove_file_if_exists, ChecksumRegistry, InstallSpec, Manifest,
    Module, Step, VerifiedInstaller,
};
use envforge_planner::{ExecutionPlan, PlanEntry};
use envforge_security::verify_installer;
use log::{debug, info, warn};

use crate::context::{
    shell_quote, wrap_for_context, ExecutionIdentity, ENV_MODULE, ENV_TARGET_USER,
    ENV_WORKSPACE_ROOT,
};
use crate::fetch::InstallerFetcher;
use crate::interrupt::InterruptFlag;
use crate::report::{
    FailureStage, ModuleFailure, ModuleReport, ModuleState, RunReport, RunStatus,
    ALREADY_SATISFIED, RUN_REPORT_SCHEMA_VERSION,
};
use crate::runner::{CommandOutcome, CommandRunner, CommandStatus, Invocation};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub target_user: String,
    pub workspace_root: PathBuf,
    /// Parent of the per-run staging directory. It has to be reachable by
    /// every execution context, so not the invoking user's home.
    pub staging_root: PathBuf,
    pub command_timeout: Duration,
    pub identity: ExecutionIdentity,
}

/// Progress hooks; the engine never renders anything itself.
pub trait RunObserver {
    fn module_started(&mut self, _entry: &PlanEntry, _position: usize, _total: usize) {}
    fn module_finished(&mut self, _report: &ModuleReport) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

enum ModuleOutcome {
    Installed,
    AlreadySatisfied,
    Failed(ModuleFailure),
    /// Fails the run even for optional modules.
    ChecksumRejected(ModuleFailure),
    Interrupted(ModuleFailure),
}

pub struct Engine<R, F> {
    runner: R,
    fetcher: F,
    options: EngineOptions,
    interrupt: InterruptFlag,
    staging_dir: Option<PathBuf>,
}

impl<R: CommandRunner, F: InstallerFetcher> Engine<R, F> {
    pub fn new(runner: R, fetcher: F, options: EngineOptions, interrupt: InterruptFlag) -> Self {
        Self {
            runner,
            fetcher,
            options,
            interrupt,
            staging_dir: None,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn run(
        &mut self,
        plan: &ExecutionPlan,
        manifest: &Manifest,
        registry: &ChecksumRegistry,
    ) -> RunReport {
        self.run_with_observer(plan, manifest, registry, &mut NoopObserver)
    }

    pub fn run_with_observer(
        &mut self,
        plan: &ExecutionPlan,
        manifest: &Manifest,
        registry: &ChecksumRegistry,
        observer: &mut dyn RunObserver,
    ) -> RunReport {
        let started_at_unix = current_unix_timestamp();
        let mut report = RunReport {
            schema_version: RUN_REPORT_SCHEMA_VERSION,
            run_id: format!("run-{started_at_unix}-{}", std::process::id()),
            started_at_unix,
            finished_at_unix: started_at_unix,
            status: RunStatus::Succeeded,
            modules: plan
                .entries
                .iter()
                .map(|entry| ModuleReport {
                    id: entry.id.clone(),
                    phase: entry.phase,
                    optional: entry.optional,
                    state: ModuleState::Pending,
                    skip_reason: None,
                    duration_ms: 0,
                    failure: None,
                })
                .collect(),
        };

        let total = plan.entries.len();
        for (position, entry) in plan.entries.iter().enumerate() {
            if report.status != RunStatus::Succeeded {
                report.modules[position].state = ModuleState::NotAttempted;
                continue;
            }
            if self.interrupt.is_set() {
                info!("run interrupted before module={}", entry.id);
                report.status = RunStatus::Interrupted;
                report.modules[position].state = ModuleState::NotAttempted;
                continue;
            }

            observer.module_started(entry, position, total);
            report.modules[position].state = ModuleState::Running;
            info!("module={} state=running phase={}", entry.id, entry.phase);

            let started = Instant::now();
            let outcome = match manifest.module(&entry.id) {
                Some(module) => self.execute_module(module, registry),
                None => ModuleOutcome::Failed(ModuleFailure {
                    stage: FailureStage::Install,
                    command: None,
                    exit_code: None,
                    timed_out: false,
                    message: "module is not declared in the manifest".to_string(),
                    output_tail: Vec::new(),
                }),
            };

            let module_report = &mut report.modules[position];
            module_report.duration_ms = started.elapsed().as_millis() as u64;
            match outcome {
                ModuleOutcome::Installed => module_report.state = ModuleState::Success,
                ModuleOutcome::AlreadySatisfied => {
                    module_report.state = ModuleState::Skipped;
                    module_report.skip_reason = Some(ALREADY_SATISFIED.to_string());
                }
                ModuleOutcome::Failed(failure) if entry.optional => {
                    warn!("optional module={} failed: {failure}", entry.id);
                    module_report.state = ModuleState::Warning;
                    module_report.failure = Some(failure);
                }
                ModuleOutcome::Failed(failure) | ModuleOutcome::ChecksumRejected(failure) => {
                    module_report.state = ModuleState::Failed;
                    module_report.failure = Some(failure);
                    report.status = RunStatus::Failed;
                }
                ModuleOutcome::Interrupted(failure) => {
                    module_report.state = ModuleState::Interrupted;
                    module_report.failure = Some(failure);
                    report.status = RunStatus::Interrupted;
                }
            }
            info!(
                "module={} state={} duration_ms={}",
                entry.id, module_report.state, module_report.duration_ms
            );
            observer.module_finished(&report.modules[position]);
        }

        self.clear_staging();
        report.finished_at_unix = current_unix_timestamp();
        report
    }

    fn execute_module(&mut self, module: &Module, registry: &ChecksumRegistry) -> ModuleOutcome {
        let mut satisfied = false;
        if let Some(check) = &module.installed_check {
            let outcome = self.run_step(module, check);
            if outcome.status == CommandStatus::Interrupted {
                return ModuleOutcome::Interrupted(failure_from(
                    FailureStage::InstalledCheck,
                    &check.command,
                    outcome,
                ));
            }
            satisfied = outcome.success();
            debug!("module={} installed_check satisfied={satisfied}", module.id);
        }

        if !satisfied {
            let installed = match &module.install {
                InstallSpec::Steps(steps) => self.run_steps(module, steps, FailureStage::Install),
                InstallSpec::Verified(installer) => {
                    self.run_verified_installer(module, installer, registry)
                }
            };
            if let Err(outcome) = installed {
                return outcome;
            }
        }

        if let Err(outcome) = self.run_steps(module, &module.verify, FailureStage::Verify) {
            return outcome;
        }

        if satisfied {
            ModuleOutcome::AlreadySatisfied
        } else {
            ModuleOutcome::Installed
        }
    }

    fn run_steps(
        &mut self,
        module: &Module,
        steps: &[Step],
        stage: FailureStage,
    ) -> Result<(), ModuleOutcome> {
        for step in steps {
            let outcome = self.run_step(module, step);
            check_outcome(stage, &step.command, outcome)?;
        }
        Ok(())
    }

    fn run_verified_installer(
        &mut self,
        module: &Module,
        installer: &VerifiedInstaller,
        registry: &ChecksumRegistry,
    ) -> Result<(), ModuleOutcome> {
        let content = self.fetcher.fetch(&installer.url).map_err(|err| {
            ModuleOutcome::Failed(ModuleFailure {
                stage: FailureStage::Fetch,
                command: Some(installer.url.clone()),
                exit_code: None,
                timed_out: false,
                message: format!("{err:#}"),
                output_tail: Vec::new(),
            })
        })?;

        if let Err(err) = verify_installer(&content, registry, installer.registry_key()) {
            warn!("module={} rejected installer content: {err}", module.id);
            return Err(ModuleOutcome::ChecksumRejected(ModuleFailure {
                stage: FailureStage::Checksum,
                command: Some(installer.url.clone()),
                exit_code: None,
                timed_out: false,
                message: err.to_string(),
                output_tail: Vec::new(),
            }));
        }

        let staged = self.stage_installer(module, installer, &content).map_err(|err| {
            ModuleOutcome::Failed(ModuleFailure {
                stage: FailureStage::Install,
                command: None,
                exit_code: None,
                timed_out: false,
                message: format!("{err:#}"),
                output_tail: Vec::new(),
            })
        })?;

        let mut command = format!(
            "{} {}",
            shell_quote(&installer.runner),
            shell_quote(&staged.to_string_lossy())
        );
        for arg in &installer.args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        let step = Step {
            run_as: module.run_as,
            command,
        };
        let outcome = self.run_step(module, &step);
        if let Err(err) = remove_file_if_exists(&staged) {
            warn!("failed to remove staged installer {}: {err}", staged.display());
        }
        check_outcome(FailureStage::Install, &step.command, outcome)
    }

    fn stage_installer(
        &mut self,
        module: &Module,
        installer: &VerifiedInstaller,
        content: &[u8],
    ) -> anyhow::Result<PathBuf> {
        use anyhow::Context;

        let dir = self.run_staging_dir()?;
        let path = dir.join(format!("{}-{}", module.id, installer.tool));
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to clear staged installer: {}", path.display()))?;
        let mut file = create_staged(&path)
            .with_context(|| format!("failed to create staged installer: {}", path.display()))?;
        file.write_all(content)
            .with_context(|| format!("failed to write staged installer: {}", path.display()))?;
        set_mode(&path, 0o644)
            .with_context(|| format!("failed to open up staged installer: {}", path.display()))?;
        Ok(path)
    }

    /// Created on first use with `create_dir`, so an existing path is never
    /// reused, and opened to mode 0755 so `sudo -u <user>` can read from it.
    fn run_staging_dir(&mut self) -> anyhow::Result<PathBuf> {
        use anyhow::Context;

        if let Some(dir) = &self.staging_dir {
            return Ok(dir.clone());
        }
        let root = &self.options.staging_root;
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create staging root: {}", root.display()))?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        let dir = root.join(format!("envforge-staging-{}-{nanos}", std::process::id()));
        fs::create_dir(&dir)
            .with_context(|| format!("failed to create staging dir: {}", dir.display()))?;
        set_mode(&dir, 0o755)
            .with_context(|| format!("failed to open up staging dir: {}", dir.display()))?;
        debug!("staging verified installers under {}", dir.display());
        self.staging_dir = Some(dir.clone());
        Ok(dir)
    }

    fn clear_staging(&mut self) {
        if let Some(dir) = self.staging_dir.take() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!("failed to remove staging dir {}: {err}", dir.display());
            }
        }
    }

    fn run_step(&mut self, module: &Module, step: &Step) -> CommandOutcome {
        let invocation = Invocation {
            module: module.id.clone(),
            command: step.command.clone(),
            line: wrap_for_context(
                step.run_as,
                &step.command,
                &self.options.target_user,
                &self.options.identity,
            ),
            env: vec![
                (ENV_TARGET_USER.to_string(), self.options.target_user.clone()),
                (
                    ENV_WORKSPACE_ROOT.to_string(),
                    self.options.workspace_root.to_string_lossy().into_owned(),
                ),
                (ENV_MODULE.to_string(), module.id.clone()),
            ],
            timeout: self.options.command_timeout,
        };
        self.runner.run(&invocation)
    }
}

fn check_outcome(
    stage: FailureStage,
    command: &str,
    outcome: CommandOutcome,
) -> Result<(), ModuleOutcome> {
    match outcome.status {
        CommandStatus::Exited(0) => Ok(()),
        CommandStatus::Interrupted => Err(ModuleOutcome::Interrupted(failure_from(
            stage, command, outcome,
        ))),
        _ => Err(ModuleOutcome::Failed(failure_from(stage, command, outcome))),
    }
}

fn failure_from(stage: FailureStage, command: &str, outcome: CommandOutcome) -> ModuleFailure {
    let message = match &outcome.status {
        CommandStatus::Exited(code) => format!("command exited with status {code}"),
        CommandStatus::Signaled => "command was terminated by a signal".to_string(),
        CommandStatus::TimedOut => "command timed out".to_string(),
        CommandStatus::Interrupted => "command was interrupted".to_string(),
        CommandStatus::SpawnFailed(reason) => reason.clone(),
    };
    ModuleFailure {
        stage,
        command: Some(command.to_string()),
        exit_code: outcome.exit_code(),
        timed_out: outcome.status == CommandStatus::TimedOut,
        message,
        output_tail: outcome.output_tail,
    }
}

#[cfg(unix)]
fn create_staged(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
}

#[cfg(not(unix))]
fn create_staged(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

/// Applied after creation; the process umask may have narrowed the mode.
#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
