//! Error types for the collection state module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building, loading or saving collection state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The file layout template could not be compiled.
    #[error("invalid file layout '{template}': {reason}")]
    InvalidLayout {
        /// The rejected template.
        template: String,
        /// Why it was rejected.
        reason: String,
    },

    /// File system error reading or writing the state file.
    #[error("IO error on collection state file {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The state file exists but does not contain valid state.
    #[error("malformed collection state file {path}: {source}")]
    Malformed {
        /// The offending file.
        path: PathBuf,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// The state file was written by an incompatible format version.
    #[error("unsupported collection state version {version} in {path}")]
    UnsupportedVersion {
        /// The offending file.
        path: PathBuf,
        /// Version found in the file.
        version: u32,
    },

    /// Ranges are unsorted or overlap.
    #[error("invalid collection ranges: {reason}")]
    InvalidRanges {
        /// Description of the violation.
        reason: String,
    },

    /// Another run holds the state file lock.
    #[error("collection state {path} is locked by another run")]
    Locked {
        /// The lock file that could not be acquired.
        path: PathBuf,
    },

    /// Serializing the state failed (shouldn't occur for well-formed state).
    #[error("failed to serialize collection state: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StateError {
    /// Creates an IO error tagged with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid layout error.
    pub fn invalid_layout(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLayout {
            template: template.into(),
            reason: reason.into(),
        }
    }
}
