use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

const SHA256_HEX_LEN: usize = 64;

/// Pinned SHA-256 digests keyed by installer tool name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRegistry {
    entries: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegistry {
    #[serde(default)]
    checksums: BTreeMap<String, String>,
}

impl ChecksumRegistry {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            kind: "checksum registry",
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ManifestError> {
        let raw: RawRegistry = toml::from_str(input).map_err(|source| ManifestError::Parse {
            kind: "checksum registry",
            source,
        })?;
        let mut registry = Self::default();
        for (key, digest) in raw.checksums {
            registry.insert(key, digest)?;
        }
        Ok(registry)
    }

    /// Digests are normalized to lowercase; anything but 64 hex chars is rejected.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        digest: impl AsRef<str>,
    ) -> Result<(), ManifestError> {
        let key = key.into();
        let digest = digest.as_ref().trim().to_ascii_lowercase();
        if key.trim().is_empty() {
            return Err(ManifestError::document(
                "checksums",
                "installer key must not be empty",
            ));
        }
        if digest.len() != SHA256_HEX_LEN || !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(ManifestError::document(
                format!("checksums.{key}"),
                "expected a 64-character SHA-256 hex digest",
            ));
        }
        self.entries.insert(key, digest);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
