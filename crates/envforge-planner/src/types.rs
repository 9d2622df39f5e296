use std::fmt;

use envforge_core::InstallMode;
use serde::{Deserialize, Serialize};

pub const PLAN_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Id(String),
    Tag(String),
    Category(String),
    /// Bare token; resolved against ids, then tags, then categories.
    Auto(String),
}

impl Selector {
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        match token.split_once(':') {
            Some(("id", value)) => Self::Id(value.trim().to_string()),
            Some(("tag", value)) => Self::Tag(value.trim().to_string()),
            Some(("category", value)) => Self::Category(value.trim().to_string()),
            _ => Self::Auto(token.to_string()),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(value) => write!(f, "id:{value}"),
            Self::Tag(value) => write!(f, "tag:{value}"),
            Self::Category(value) => write!(f, "category:{value}"),
            Self::Auto(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub only: Vec<Selector>,
    pub skip: Vec<String>,
}

impl Selection {
    pub fn from_tokens<S: AsRef<str>>(only: &[S], skip: &[S]) -> Self {
        Self {
            only: only.iter().map(|token| Selector::parse(token.as_ref())).collect(),
            skip: skip
                .iter()
                .map(|id| id.as_ref().trim().to_string())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.only.is_empty() && self.skip.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InclusionReason {
    Explicit,
    Tag { tag: String },
    Category { category: String },
    Default,
    DependencyClosure { required_by: String },
}

impl fmt::Display for InclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => f.write_str("explicit"),
            Self::Tag { tag } => write!(f, "tag:{tag}"),
            Self::Category { category } => write!(f, "category:{category}"),
            Self::Default => f.write_str("default"),
            Self::DependencyClosure { required_by } => {
                write!(f, "dependency-closure (required by {required_by})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub id: String,
    pub phase: u8,
    pub optional: bool,
    pub reason: InclusionReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub schema_version: u32,
    pub mode: InstallMode,
    pub entries: Vec<PlanEntry>,
}

impl ExecutionPlan {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.id.as_str())
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    pub fn entry(&self, id: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
