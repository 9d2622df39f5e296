mod driver;
mod error;
mod layout;
mod lock;
mod machine;
mod path;
mod state;

pub use driver::{
    parse_offered_release, parse_os_release_version, HopResult, SystemDriver, UpgradeDriver,
    RESUME_UNIT_NAME,
};
pub use error::UpgradeError;
pub use layout::{default_system_root, SystemLayout, SYSTEM_DIR_ENV};
pub use lock::{lock_holder, UpgradeLock};
pub use machine::{UpgradeOutcome, UpgradeStateMachine};
pub use path::{default_catalog, hop_path};
pub use state::{
    archive_state, load_state, persist_state, InstallRequest, UpgradeStage, UpgradeState,
    UPGRADE_STATE_SCHEMA_VERSION,
};

#[cfg(test)]
mod tests;
