use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use envforge_core::{current_unix_timestamp, write_atomic, ReleaseVersion};
use serde::{Deserialize, Serialize};

use crate::error::UpgradeError;
use crate::layout::SystemLayout;

pub const UPGRADE_STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStage {
    NotStarted,
    Preparing,
    Upgrading,
    AwaitingReboot,
    Resuming,
    Completed,
}

impl UpgradeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Preparing => "preparing",
            Self::Upgrading => "upgrading",
            Self::AwaitingReboot => "awaiting_reboot",
            Self::Resuming => "resuming",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for UpgradeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Module installation to carry out once the upgrade completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub checksums: Option<PathBuf>,
    #[serde(default)]
    pub only: Vec<String>,
    #[serde(default)]
    pub skip: Vec<String>,
    /// User state root resolved when the upgrade started; the boot-time
    /// resume has no `HOME` to derive it from.
    #[serde(default)]
    pub user_root: Option<PathBuf>,
    #[serde(default)]
    pub target_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeState {
    pub schema_version: u32,
    pub stage: UpgradeStage,
    pub current_version: ReleaseVersion,
    pub target_version: ReleaseVersion,
    #[serde(default)]
    pub completed_hops: Vec<ReleaseVersion>,
    #[serde(default)]
    pub needs_reboot: bool,
    #[serde(default)]
    pub updated_at_unix: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub install_request: Option<InstallRequest>,
}

impl UpgradeState {
    pub fn new(
        current_version: ReleaseVersion,
        target_version: ReleaseVersion,
        install_request: Option<InstallRequest>,
    ) -> Self {
        Self {
            schema_version: UPGRADE_STATE_SCHEMA_VERSION,
            stage: UpgradeStage::NotStarted,
            current_version,
            target_version,
            completed_hops: Vec::new(),
            needs_reboot: false,
            updated_at_unix: current_unix_timestamp(),
            last_error: None,
            install_request,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stage == UpgradeStage::Completed
    }
}

pub fn load_state(layout: &SystemLayout) -> Result<Option<UpgradeState>, UpgradeError> {
    let path = layout.state_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(UpgradeError::io(
                format!("failed to read upgrade state: {}", path.display()),
                err,
            ));
        }
    };

    let state: UpgradeState = serde_json::from_str(&raw).map_err(|source| UpgradeError::StateParse {
        path: path.clone(),
        source,
    })?;
    if state.schema_version > UPGRADE_STATE_SCHEMA_VERSION {
        return Err(UpgradeError::UnsupportedSchema {
            path,
            found: state.schema_version,
            supported: UPGRADE_STATE_SCHEMA_VERSION,
        });
    }
    Ok(Some(state))
}

/// Stamps `updated_at_unix` and atomically replaces the state file.
pub fn persist_state(layout: &SystemLayout, state: &mut UpgradeState) -> Result<(), UpgradeError> {
    state.updated_at_unix = current_unix_timestamp();
    let path = layout.state_path();
    let payload = serde_json::to_string_pretty(state).map_err(|source| UpgradeError::StateParse {
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, payload.as_bytes()).map_err(|err| {
        UpgradeError::io(
            format!("failed to write upgrade state: {}", path.display()),
            err,
        )
    })
}

/// Moves a finished state file into `history/` and returns its new path.
pub fn archive_state(layout: &SystemLayout, state: &UpgradeState) -> Result<PathBuf, UpgradeError> {
    let dir = layout.history_dir();
    fs::create_dir_all(&dir)
        .map_err(|err| UpgradeError::io(format!("failed to create {}", dir.display()), err))?;

    let mut archived = dir.join(format!(
        "upgrade-{}-{}.json",
        state.updated_at_unix, state.target_version
    ));
    let mut sequence = 1_u32;
    while archived.exists() {
        archived = dir.join(format!(
            "upgrade-{}-{}-{sequence}.json",
            state.updated_at_unix, state.target_version
        ));
        sequence += 1;
    }

    let path = layout.state_path();
    fs::rename(&path, &archived).map_err(|err| {
        UpgradeError::io(
            format!(
                "failed to archive upgrade state: {} -> {}",
                path.display(),
                archived.display()
            ),
            err,
        )
    })?;
    Ok(archived)
}
