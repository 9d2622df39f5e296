use std::path::{Path, PathBuf};

pub const SYSTEM_DIR_ENV: &str = "ENVFORGE_SYSTEM_DIR";
const DEFAULT_SYSTEM_ROOT: &str = "/var/lib/envforge";

/// Root-owned state that has to survive a reboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemLayout {
    root: PathBuf,
}

impl SystemLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("upgrade-state.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("upgrade.lock")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }
}

pub fn default_system_root() -> PathBuf {
    std::env::var_os(SYSTEM_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSTEM_ROOT))
}
