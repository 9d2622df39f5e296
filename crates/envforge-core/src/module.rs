use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const MIN_PHASE: u8 = 1;
pub const MAX_PHASE: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAs {
    Root,
    TargetUser,
    TargetUserNoShell,
    InvokingUser,
}

impl RunAs {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::TargetUser => "target_user",
            Self::TargetUserNoShell => "target_user_no_shell",
            Self::InvokingUser => "invoking_user",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "root" | "privileged" => Some(Self::Root),
            "target_user" | "user" => Some(Self::TargetUser),
            "target_user_no_shell" | "user_no_shell" => Some(Self::TargetUserNoShell),
            "invoking_user" | "current_user" => Some(Self::InvokingUser),
            _ => None,
        }
    }
}

impl fmt::Display for RunAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single shell command bound to the context it runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub run_as: RunAs,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedInstaller {
    pub tool: String,
    pub url: String,
    pub runner: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl VerifiedInstaller {
    /// Checksum registry key for the fetched content.
    pub fn registry_key(&self) -> &str {
        &self.tool
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallSpec {
    Steps(Vec<Step>),
    Verified(VerifiedInstaller),
}

impl InstallSpec {
    pub fn verified_installer(&self) -> Option<&VerifiedInstaller> {
        match self {
            Self::Steps(_) => None,
            Self::Verified(installer) => Some(installer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub phase: u8,
    pub run_as: RunAs,
    pub description: Option<String>,
    pub dependencies: Vec<String>,
    pub tags: BTreeSet<String>,
    pub optional: bool,
    pub enabled_by_default: bool,
    pub installed_check: Option<Step>,
    pub install: InstallSpec,
    pub verify: Vec<Step>,
}

impl Module {
    /// First dotted segment of the id (`runtimes.node` -> `runtimes`).
    pub fn category(&self) -> &str {
        self.id.split('.').next().unwrap_or(&self.id)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn verified_installer(&self) -> Option<&VerifiedInstaller> {
        self.install.verified_installer()
    }
}
