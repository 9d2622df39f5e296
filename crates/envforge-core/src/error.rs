use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {kind}: {path}")]
    Io {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {kind}: {source}")]
    Parse {
        kind: &'static str,
        #[source]
        source: toml::de::Error,
    },

    /// `module` is the module id, or `#<index>` when the id itself is unusable.
    #[error("schema error in module '{module}' field '{field}': {message}")]
    Schema {
        module: String,
        field: String,
        message: String,
    },

    #[error("schema error in field '{field}': {message}")]
    Document { field: String, message: String },
}

impl ManifestError {
    pub(crate) fn schema(
        module: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Schema {
            module: module.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn document(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Document {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid release version '{input}': expected <major>.<minor>")]
pub struct VersionParseError {
    pub input: String,
}
