use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("module '{id}' is declared more than once")]
    DuplicateModule { id: String },

    #[error("module '{module}' depends on unknown module '{missing}'")]
    MissingDependency { module: String, missing: String },

    /// `path` starts and ends with the same module.
    #[error("dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error(
        "module '{module}' (phase {module_phase}) depends on '{dependency}' from later phase {dependency_phase}"
    )]
    PhaseViolation {
        module: String,
        module_phase: u8,
        dependency: String,
        dependency_phase: u8,
    },

    #[error("modules '{first}' and '{second}' both normalize to identifier '{normalized}'")]
    NameCollision {
        first: String,
        second: String,
        normalized: String,
    },

    #[error("module '{module}' normalizes to reserved identifier '{normalized}'")]
    ReservedNameCollision { module: String, normalized: String },

    #[error("module '{module}' uses verified installer '{key}' with no pinned checksum")]
    MissingChecksum { module: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionError {
    #[error("selector '{selector}' matches no module id, tag, or category")]
    UnknownSelector { selector: String },

    #[error("cannot skip unknown module '{id}'")]
    UnknownModule { id: String },

    #[error("cannot skip '{excluded}': included module '{dependent}' depends on it")]
    UnsatisfiableExclusion { excluded: String, dependent: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("manifest failed validation with {} error(s)", .0.len())]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Selection(#[from] SelectionError),
}
