use std::io;
use std::path::PathBuf;

use envforge_core::ReleaseVersion;
use thiserror::Error;

use crate::state::UpgradeStage;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("upgrade lock is held by another process{}", .pid.map(|pid| format!(" (pid={pid})")).unwrap_or_default())]
    LockConflict { pid: Option<u32> },

    #[error("an upgrade to {target} is already in progress (stage={stage}, current={current}); run `envforge resume`")]
    UpgradeInProgress {
        stage: UpgradeStage,
        current: ReleaseVersion,
        target: ReleaseVersion,
    },

    #[error("upgrade precondition failed: {reason}")]
    PreconditionFailed { reason: String },

    #[error("upgrade state is stale: expected system version {expected}, found {actual}")]
    StaleState {
        expected: ReleaseVersion,
        actual: ReleaseVersion,
    },

    #[error("target release {target} is not in the release catalog")]
    UnknownTarget { target: ReleaseVersion },

    #[error("upgrade hop {from} -> {to} failed: {message}")]
    HopFailed {
        from: ReleaseVersion,
        to: ReleaseVersion,
        message: String,
    },

    #[error("failed to detect system release: {reason}")]
    VersionProbe { reason: String },

    #[error("upgrade state schema is newer than supported: path={} schema_version={found} supported={supported}", .path.display())]
    UnsupportedSchema {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("failed to parse upgrade state: {}", .path.display())]
    StateParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl UpgradeError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
