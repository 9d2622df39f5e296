mod checksums;
mod error;
mod fs_utils;
mod manifest;
mod module;
mod version;

pub use checksums::ChecksumRegistry;
pub use error::{ManifestError, VersionParseError};
pub use fs_utils::{current_unix_timestamp, remove_file_if_exists, write_atomic};
pub use manifest::{Defaults, InstallMode, Manifest, UpgradeSettings, MANIFEST_SCHEMA_VERSION};
pub use module::{InstallSpec, Module, RunAs, Step, VerifiedInstaller, MAX_PHASE, MIN_PHASE};
pub use version::ReleaseVersion;
