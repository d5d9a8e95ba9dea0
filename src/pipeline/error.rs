//! Error types for the collection pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::ErrorList;
use crate::events::NotifyError;
use crate::limiter::LimiterError;
use crate::state::StateError;

/// Errors raised by a [`Source`](super::Source) while discovering or
/// downloading artifacts.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Filesystem error.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The artifact no longer exists at the source.
    #[error("artifact not found: {name}")]
    NotFound {
        /// Artifact name.
        name: String,
    },

    /// Source construction was given an invalid configuration.
    #[error("invalid source configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },

    /// No constructor registered under this source type.
    #[error("unknown source type '{name}' (registered: {registered})")]
    UnknownSource {
        /// Requested type.
        name: String,
        /// Comma separated registered types.
        registered: String,
    },

    /// The run was cancelled.
    #[error("collection cancelled")]
    Cancelled,

    /// Source specific failure.
    #[error("{message}")]
    Other {
        /// Description.
        message: String,
    },
}

impl SourceError {
    /// Creates an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a source specific error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

/// Errors raised while turning a downloaded artifact into raw rows.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Filesystem error.
    #[error("I/O error reading {path}: {source}")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The row queue was closed by the consumer.
    #[error("row queue closed before loading finished")]
    QueueClosed,

    /// The loader task panicked or was aborted.
    #[error("loader task failed: {message}")]
    TaskFailed {
        /// Panic or join message.
        message: String,
    },

    /// The run was cancelled.
    #[error("loading cancelled")]
    Cancelled,
}

impl LoaderError {
    /// Creates an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by a single mapper stage for a single row.
#[derive(Debug, Error)]
pub enum MapperError {
    /// The row payload is of a kind this mapper does not handle.
    #[error("mapper '{mapper}' cannot handle {kind} payload")]
    UnsupportedPayload {
        /// Mapper name.
        mapper: String,
        /// Payload kind received.
        kind: &'static str,
    },

    /// The payload was not valid JSON.
    #[error("mapper '{mapper}' could not parse JSON: {source}")]
    InvalidJson {
        /// Mapper name.
        mapper: String,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A field the mapper requires is missing or has the wrong type.
    #[error("mapper '{mapper}' expected array field '{field}'")]
    MissingField {
        /// Mapper name.
        mapper: String,
        /// Field name.
        field: String,
    },

    /// Mapper specific failure.
    #[error("mapper '{mapper}' failed: {message}")]
    Failed {
        /// Mapper name.
        mapper: String,
        /// Description.
        message: String,
    },
}

/// One failure encountered while extracting rows from an artifact.
#[derive(Debug, Error)]
pub enum ExtractFailure {
    /// The loader failed.
    #[error("load failed: {0}")]
    Load(#[from] LoaderError),
    /// A mapper stage failed for one row.
    #[error("mapping failed: {0}")]
    Map(#[from] MapperError),
    /// Observers failed to accept a row.
    #[error("row emission failed: {0}")]
    Emit(#[from] NotifyError),
}

/// Top-level pipeline error.
///
/// Per-artifact variants are reported through [`Event::Error`](crate::events::Event::Error)
/// and never abort a run. `Discovery`, `State` and `Cancelled` are returned
/// from [`Collector::collect`](super::Collector::collect).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Artifact discovery failed.
    #[error("artifact discovery failed: {0}")]
    Discovery(#[source] SourceError),

    /// Capacity could not be acquired for an artifact.
    #[error("could not acquire capacity for {artifact}: {source}")]
    Limiter {
        /// Artifact name.
        artifact: String,
        /// Underlying error.
        #[source]
        source: LimiterError,
    },

    /// Downloading one artifact failed.
    #[error("download of {artifact} failed: {source}")]
    Download {
        /// Artifact name.
        artifact: String,
        /// Underlying error.
        #[source]
        source: SourceError,
    },

    /// Loading, mapping or emitting rows of one artifact failed.
    #[error("extraction of {artifact} failed: {errors}")]
    Extraction {
        /// Artifact name.
        artifact: String,
        /// Every failure seen for the artifact.
        #[source]
        errors: ErrorList<ExtractFailure>,
    },

    /// A per-artifact task panicked.
    #[error("task for {artifact} panicked: {message}")]
    TaskPanicked {
        /// Artifact name.
        artifact: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// Collection state could not be persisted.
    #[error(transparent)]
    State(#[from] StateError),

    /// Invalid collector settings.
    #[error("invalid collector setting '{field}': {reason}")]
    InvalidSetting {
        /// Setting name.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },

    /// The run was cancelled before completing.
    #[error("collection cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Name of the artifact this error concerns, if any.
    #[must_use]
    pub fn artifact(&self) -> Option<&str> {
        match self {
            Self::Limiter { artifact, .. }
            | Self::Download { artifact, .. }
            | Self::Extraction { artifact, .. }
            | Self::TaskPanicked { artifact, .. } => Some(artifact),
            Self::Discovery(_)
            | Self::State(_)
            | Self::InvalidSetting { .. }
            | Self::Cancelled => None,
        }
    }
}
