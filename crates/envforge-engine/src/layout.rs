use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-user state root holding run history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_report_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    pub fn last_run_path(&self) -> PathBuf {
        self.root.join("last-run.json")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        let dir = self.runs_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))
    }
}

pub fn default_user_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("ENVFORGE_HOME").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(root));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user state dir")?;
    Ok(PathBuf::from(home).join(".envforge"))
}

/// Verified installers are staged here rather than under the user state
/// root: a `target_user` command started through sudo cannot enter `/root`.
pub fn default_staging_root() -> PathBuf {
    std::env::temp_dir()
}
