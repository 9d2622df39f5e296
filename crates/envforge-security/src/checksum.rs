use std::io::{self, Read};

use envforge_core::ChecksumRegistry;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("checksum mismatch for '{key}': expected {expected}, got {actual}")]
    Mismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("no pinned checksum for installer '{key}'")]
    MissingEntry { key: String },
    #[error("pinned checksum for '{key}' is not a SHA-256 hex digest")]
    MalformedDigest { key: String },
    #[error("failed to read content for '{key}'")]
    Read {
        key: String,
        #[source]
        source: io::Error,
    },
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compares decoded digests byte for byte; hex case does not matter.
pub fn verify_sha256(bytes: &[u8], expected_hex: &str) -> Option<bool> {
    let expected = decode_digest(expected_hex)?;
    let actual = Sha256::digest(bytes);
    Some(actual.as_slice() == expected.as_slice())
}

pub fn verify_sha256_reader<R: Read>(
    key: &str,
    reader: &mut R,
    expected_hex: &str,
) -> Result<(), ChecksumError> {
    let expected = decode_digest(expected_hex).ok_or_else(|| ChecksumError::MalformedDigest {
        key: key.to_string(),
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = reader.read(&mut buf).map_err(|source| ChecksumError::Read {
            key: key.to_string(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    let actual = hasher.finalize();
    if actual.as_slice() != expected.as_slice() {
        return Err(ChecksumError::Mismatch {
            key: key.to_string(),
            expected: hex::encode(&expected),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

/// Gate for fetched installer content. Nothing may execute unless this returns Ok.
pub fn verify_installer(
    content: &[u8],
    registry: &ChecksumRegistry,
    key: &str,
) -> Result<(), ChecksumError> {
    let expected_hex = registry
        .get(key)
        .ok_or_else(|| ChecksumError::MissingEntry {
            key: key.to_string(),
        })?;
    verify_sha256_reader(key, &mut &content[..], expected_hex)
}

fn decode_digest(input: &str) -> Option<Vec<u8>> {
    let decoded = hex::decode(input.trim()).ok()?;
    (decoded.len() == 32).then_some(decoded)
}
