//! Source reading artifacts from a local directory tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::pipeline::{
    ArtifactInfo, DiscoveryContext, DownloadedArtifact, Enrichment, Source, SourceError,
};
use crate::state::{CollectionOrder, FileLayout, StateConfig};

/// Configuration of a [`LocalDirectorySource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalDirectoryConfig {
    /// Root directory to walk.
    pub path: PathBuf,
    /// Layout template matched against paths relative to `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_layout: Option<String>,
    /// Name recorded in row enrichment. Defaults to the directory name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// Order artifacts are reported in.
    #[serde(default)]
    pub order: CollectionOrder,
    /// Whether each run continues the previous one.
    #[serde(default)]
    pub has_continuation: bool,
}

impl LocalDirectoryConfig {
    /// Chronological configuration for `path` without a layout.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_layout: None,
            source_name: None,
            order: CollectionOrder::Chronological,
            has_continuation: false,
        }
    }

    /// Sets the layout template.
    #[must_use]
    pub fn with_file_layout(mut self, layout: impl Into<String>) -> Self {
        self.file_layout = Some(layout.into());
        self
    }

    /// Sets the enrichment source name.
    #[must_use]
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    /// Sets order and continuation.
    #[must_use]
    pub fn with_mode(mut self, order: CollectionOrder, has_continuation: bool) -> Self {
        self.order = order;
        self.has_continuation = has_continuation;
        self
    }
}

impl StateConfig for LocalDirectoryConfig {
    fn file_layout(&self) -> Option<&str> {
        self.file_layout.as_deref()
    }

    fn order(&self) -> CollectionOrder {
        self.order
    }

    fn has_continuation(&self) -> bool {
        self.has_continuation
    }
}

/// Discovers every file below a directory as an artifact.
///
/// Artifact names are `/`-separated paths relative to the root. With a
/// layout, files that do not match it are ignored and the timestamp comes
/// from the layout's time fields; otherwise the modification time is used.
#[derive(Debug, Clone)]
pub struct LocalDirectorySource {
    config: LocalDirectoryConfig,
    layout: Option<FileLayout>,
}

impl LocalDirectorySource {
    /// Source type under which this source is registered.
    pub const SOURCE_TYPE: &'static str = "local_directory";

    /// Creates the source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidConfig`] if the layout template is invalid.
    pub fn new(config: LocalDirectoryConfig) -> Result<Self, SourceError> {
        let layout = config
            .file_layout
            .as_deref()
            .map(FileLayout::parse)
            .transpose()
            .map_err(|error| SourceError::InvalidConfig {
                reason: error.to_string(),
            })?;
        Ok(Self { config, layout })
    }

    /// Builds the source from JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidConfig`] if the JSON does not describe a
    /// valid [`LocalDirectoryConfig`].
    pub fn from_value(value: &serde_json::Value) -> Result<Arc<dyn Source>, SourceError> {
        let config: LocalDirectoryConfig = serde_json::from_value(value.clone()).map_err(|error| {
            SourceError::InvalidConfig {
                reason: error.to_string(),
            }
        })?;
        Ok(Arc::new(Self::new(config)?))
    }

    /// The source configuration.
    #[must_use]
    pub fn config(&self) -> &LocalDirectoryConfig {
        &self.config
    }

    fn base_enrichment(&self) -> Enrichment {
        let name = self.config.source_name.clone().or_else(|| {
            self.config
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        });
        let enrichment = Enrichment::for_source(Self::SOURCE_TYPE);
        match name {
            Some(name) => enrichment.with_source_name(name),
            None => enrichment,
        }
    }
}

#[async_trait]
impl Source for LocalDirectorySource {
    fn name(&self) -> &str {
        Self::SOURCE_TYPE
    }

    #[instrument(skip_all, fields(root = %self.config.path.display()))]
    async fn discover_artifacts(&self, ctx: &DiscoveryContext<'_>) -> Result<(), SourceError> {
        let scan = Scan {
            root: self.config.path.clone(),
            layout: self.layout.clone(),
            enrichment: self.base_enrichment(),
            order: self.config.order,
        };
        let artifacts = tokio::task::spawn_blocking(move || scan.run())
            .await
            .map_err(|error| SourceError::other(format!("directory scan task failed: {error}")))??;

        info!(artifacts = artifacts.len(), "directory scanned");
        for artifact in artifacts {
            ctx.discovered(artifact).await?;
        }
        Ok(())
    }

    async fn download_artifact(
        &self,
        _cancel: &CancellationToken,
        info: ArtifactInfo,
    ) -> Result<DownloadedArtifact, SourceError> {
        let path = self.config.path.join(&info.name);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(DownloadedArtifact::new(info, path)),
            Ok(_) => Err(SourceError::NotFound { name: info.name }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::NotFound { name: info.name })
            }
            Err(error) => Err(SourceError::io(path, error)),
        }
    }
}

struct Scan {
    root: PathBuf,
    layout: Option<FileLayout>,
    enrichment: Enrichment,
    order: CollectionOrder,
}

impl Scan {
    fn run(&self) -> Result<Vec<ArtifactInfo>, SourceError> {
        let mut files = Vec::new();
        walk(&self.root, &mut files)?;

        let mut artifacts = Vec::with_capacity(files.len());
        for path in files {
            if let Some(artifact) = self.describe(&path)? {
                artifacts.push(artifact);
            }
        }

        artifacts.sort_by(|a, b| (a.timestamp, &a.name).cmp(&(b.timestamp, &b.name)));
        if self.order == CollectionOrder::ReverseChronological {
            artifacts.reverse();
        }
        Ok(artifacts)
    }

    fn describe(&self, path: &Path) -> Result<Option<ArtifactInfo>, SourceError> {
        let Some(name) = relative_name(&self.root, path) else {
            return Ok(None);
        };

        let mut enrichment = self
            .enrichment
            .clone()
            .with_location(path.display().to_string());
        let mut timestamp = None;

        if let Some(layout) = &self.layout {
            let Some(matched) = layout.extract(&name) else {
                debug!(artifact = %name, layout = layout.template(), "file does not match layout");
                return Ok(None);
            };
            timestamp = matched.timestamp;
            enrichment.fields.extend(matched.fields);
        }

        let timestamp = match timestamp {
            Some(timestamp) => timestamp,
            None => modified_time(path)?,
        };

        Ok(Some(
            ArtifactInfo::new(name)
                .with_timestamp(timestamp)
                .with_enrichment(enrichment),
        ))
    }
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), SourceError> {
    let entries = std::fs::read_dir(dir).map_err(|error| SourceError::io(dir, error))?;
    for entry in entries {
        let entry = entry.map_err(|error| SourceError::io(dir, error))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|error| SourceError::io(&path, error))?;
        if file_type.is_dir() {
            walk(&path, files)?;
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>, SourceError> {
    let modified = std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(|error| SourceError::io(path, error))?;
    Ok(DateTime::<Utc>::from(modified))
}
