use std::fmt;

use serde::{Deserialize, Serialize};

pub const RUN_REPORT_SCHEMA_VERSION: u32 = 1;
pub const ALREADY_SATISFIED: &str = "already-satisfied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Pending,
    Running,
    Success,
    Skipped,
    Failed,
    Warning,
    Interrupted,
    NotAttempted,
}

impl ModuleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Warning => "warning",
            Self::Interrupted => "interrupted",
            Self::NotAttempted => "not-attempted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    InstalledCheck,
    Install,
    Fetch,
    Checksum,
    Verify,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstalledCheck => "installed_check",
            Self::Install => "install",
            Self::Fetch => "fetch",
            Self::Checksum => "checksum",
            Self::Verify => "verify",
        }
    }
}

/// Everything needed to diagnose a failed module without re-running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFailure {
    pub stage: FailureStage,
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub message: String,
    #[serde(default)]
    pub output_tail: Vec<String>,
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage={} {}", self.stage.as_str(), self.message)?;
        if let Some(command) = &self.command {
            write!(f, " command='{command}'")?;
        }
        if let Some(code) = self.exit_code {
            write!(f, " exit_code={code}")?;
        }
        if self.timed_out {
            f.write_str(" timed_out=true")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReport {
    pub id: String,
    pub phase: u8,
    pub optional: bool,
    pub state: ModuleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ModuleFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub run_id: String,
    pub started_at_unix: u64,
    #[serde(default)]
    pub finished_at_unix: u64,
    pub status: RunStatus,
    pub modules: Vec<ModuleReport>,
}

impl RunReport {
    pub fn module(&self, id: &str) -> Option<&ModuleReport> {
        self.modules.iter().find(|module| module.id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<ModuleState> {
        self.module(id).map(|module| module.state)
    }

    /// The module that stopped the run, if any.
    pub fn halted_by(&self) -> Option<&ModuleReport> {
        self.modules
            .iter()
            .find(|module| matches!(module.state, ModuleState::Failed | ModuleState::Interrupted))
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ModuleReport> {
        self.modules
            .iter()
            .filter(|module| module.state == ModuleState::Warning)
    }

    pub fn count(&self, state: ModuleState) -> usize {
        self.modules
            .iter()
            .filter(|module| module.state == state)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
