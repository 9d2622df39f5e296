use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use envforge_core::{Manifest, ReleaseVersion};
use envforge_engine::{
    default_user_root, EngineOptions, ExecutionIdentity, DEFAULT_COMMAND_TIMEOUT,
};
use envforge_planner::Selection;
use envforge_upgrade::{default_catalog, default_system_root, InstallRequest};

use crate::Cli;

pub(crate) const DEFAULT_MANIFEST_FILE: &str = "envforge.toml";
pub(crate) const DEFAULT_CHECKSUMS_FILE: &str = "checksums.toml";

/// Everything one invocation needs, resolved from flags, environment,
/// and built-in defaults. Manifest `defaults` are layered in later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunConfig {
    pub manifest_path: PathBuf,
    pub checksums_path: PathBuf,
    /// A missing checksum file is only an error when it was asked for.
    pub checksums_explicit: bool,
    pub only: Vec<String>,
    pub skip: Vec<String>,
    pub target_version: Option<ReleaseVersion>,
    pub skip_os_upgrade: bool,
    pub json: bool,
    pub command_timeout: Duration,
    pub reboot: bool,
    pub system_root: PathBuf,
    /// Set when replaying a recorded install; otherwise resolved from the
    /// environment by the flows that touch user state.
    pub user_root: Option<PathBuf>,
    pub target_user: Option<String>,
}

impl RunConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let command_timeout = match cli.command_timeout {
            Some(0) => return Err(anyhow!("--command-timeout must be greater than zero")),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_COMMAND_TIMEOUT,
        };

        Ok(Self {
            manifest_path: cli
                .manifest
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_FILE)),
            checksums_path: cli
                .checksums
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKSUMS_FILE)),
            checksums_explicit: cli.checksums.is_some(),
            only: cli.only.clone(),
            skip: cli.skip.clone(),
            target_version: cli.target_version,
            skip_os_upgrade: cli.skip_os_upgrade,
            json: cli.json,
            command_timeout,
            reboot: !cli.no_reboot,
            system_root: default_system_root(),
            user_root: None,
            target_user: None,
        })
    }

    /// Replays the install recorded when an upgrade started. The OS upgrade
    /// is already done at this point.
    pub fn for_recorded_install(&self, request: &InstallRequest) -> Self {
        let mut config = self.clone();
        if let Some(manifest) = &request.manifest {
            config.manifest_path = manifest.clone();
        }
        if let Some(checksums) = &request.checksums {
            config.checksums_path = checksums.clone();
            config.checksums_explicit = true;
        }
        if request.user_root.is_some() {
            config.user_root = request.user_root.clone();
        }
        if request.target_user.is_some() {
            config.target_user = request.target_user.clone();
        }
        config.only = request.only.clone();
        config.skip = request.skip.clone();
        config.target_version = None;
        config.skip_os_upgrade = true;
        config
    }

    /// Paths are made absolute: resume usually runs from a boot-time unit
    /// with a different working directory.
    pub fn install_request(&self, target_user: Option<String>) -> Result<InstallRequest> {
        Ok(InstallRequest {
            manifest: Some(absolute_path(&self.manifest_path)?),
            checksums: Some(absolute_path(&self.checksums_path)?),
            only: self.only.clone(),
            skip: self.skip.clone(),
            user_root: Some(absolute_path(&self.resolve_user_root()?)?),
            target_user,
        })
    }

    pub fn resolve_user_root(&self) -> Result<PathBuf> {
        match &self.user_root {
            Some(root) => Ok(root.clone()),
            None => default_user_root(),
        }
    }

    pub fn selection(&self) -> Selection {
        Selection::from_tokens(&self.only, &self.skip)
    }

    pub fn upgrade_target(&self, manifest: &Manifest) -> Option<ReleaseVersion> {
        if self.skip_os_upgrade {
            return None;
        }
        self.target_version
            .or_else(|| manifest.upgrade.as_ref().and_then(|upgrade| upgrade.target))
    }

    /// Manifest setting, then the user recorded when an upgrade started, then
    /// the sudo caller, then the current user.
    pub fn target_user(
        &self,
        manifest: &Manifest,
        identity: &ExecutionIdentity,
    ) -> Result<String> {
        resolve_target_user(
            manifest.defaults.user.as_deref().or(self.target_user.as_deref()),
            std::env::var("SUDO_USER").ok().as_deref(),
            identity.user.as_deref(),
        )
    }

    pub fn engine_options(
        &self,
        manifest: &Manifest,
        identity: ExecutionIdentity,
        staging_root: PathBuf,
    ) -> Result<EngineOptions> {
        let target_user = self.target_user(manifest, &identity)?;
        let workspace_root =
            resolve_workspace_root(manifest.defaults.workspace_root.as_deref(), &target_user);
        Ok(EngineOptions {
            target_user,
            workspace_root,
            staging_root,
            command_timeout: self.command_timeout,
            identity,
        })
    }
}

pub(crate) fn release_catalog(manifest: &Manifest) -> Vec<ReleaseVersion> {
    match &manifest.upgrade {
        Some(upgrade) if !upgrade.releases.is_empty() => upgrade.releases.clone(),
        _ => default_catalog(),
    }
}

/// Manifest setting first, then the user who invoked sudo, then the
/// current user.
pub(crate) fn resolve_target_user(
    configured: Option<&str>,
    sudo_user: Option<&str>,
    current_user: Option<&str>,
) -> Result<String> {
    [configured, sudo_user, current_user]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|user| !user.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            anyhow!("cannot determine target user; set defaults.user in the manifest")
        })
}

pub(crate) fn resolve_workspace_root(configured: Option<&Path>, target_user: &str) -> PathBuf {
    if let Some(root) = configured {
        return root.to_path_buf();
    }
    let home = if target_user == "root" {
        PathBuf::from("/root")
    } else {
        Path::new("/home").join(target_user)
    };
    home.join("workspace")
}

pub(crate) fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    Ok(cwd.join(path))
}
