//! Artifacts discovered and downloaded by a source.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::WatermarkDelta;

/// Provenance metadata attached to every row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    /// Kind of source, e.g. `local_directory`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// Configured name of the source instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// Where the artifact came from (path, URL, stream name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
    /// Additional fields, such as those captured from the artifact name.
    #[serde(default, flatten)]
    pub fields: BTreeMap<String, String>,
}

impl Enrichment {
    /// Creates enrichment for a source type.
    #[must_use]
    pub fn for_source(source_type: impl Into<String>) -> Self {
        Self {
            source_type: Some(source_type.into()),
            ..Self::default()
        }
    }

    /// Sets the source name.
    #[must_use]
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    /// Sets the source location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.source_location = Some(location.into());
        self
    }

    /// Adds an extra field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A discovered remote unit containing one or more rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Identifier of the artifact, unique within its source.
    pub name: String,
    /// Name before the source renamed it during download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    /// When the artifact's data occurred, if determinable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Provenance metadata for rows from this artifact.
    #[serde(default)]
    pub enrichment: Enrichment,
}

impl ArtifactInfo {
    /// Creates an artifact with no timestamp or enrichment.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            original_name: None,
            timestamp: None,
            enrichment: Enrichment::default(),
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the enrichment fields.
    #[must_use]
    pub fn with_enrichment(mut self, enrichment: Enrichment) -> Self {
        self.enrichment = enrichment;
        self
    }

    /// Records the name the artifact had before download renamed it.
    #[must_use]
    pub fn with_original_name(mut self, original_name: impl Into<String>) -> Self {
        self.original_name = Some(original_name.into());
        self
    }
}

/// An artifact available locally after download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    /// The artifact as discovered.
    pub info: ArtifactInfo,
    /// Local file holding the artifact's contents.
    pub local_path: PathBuf,
    /// Watermark progress the source wants recorded with this download.
    pub watermark: Option<WatermarkDelta>,
}

impl DownloadedArtifact {
    /// Creates a downloaded artifact without a watermark delta.
    #[must_use]
    pub fn new(info: ArtifactInfo, local_path: impl Into<PathBuf>) -> Self {
        Self {
            info,
            local_path: local_path.into(),
            watermark: None,
        }
    }

    /// Attaches a watermark delta.
    #[must_use]
    pub fn with_watermark(mut self, watermark: WatermarkDelta) -> Self {
        self.watermark = Some(watermark);
        self
    }

    /// Whether the local file is gzip-compressed, judged by extension.
    #[must_use]
    pub fn is_gzip(&self) -> bool {
        self.local_path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("gz"))
    }
}
