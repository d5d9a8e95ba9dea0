//! The source abstraction: where artifacts come from.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::artifact::{ArtifactInfo, DownloadedArtifact};
use super::error::SourceError;

/// Receives artifacts as a source discovers them.
///
/// [`accept`](ArtifactSink::accept) applies back-pressure: it may wait for
/// pipeline capacity before returning.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Handles one discovered artifact.
    async fn accept(&self, info: ArtifactInfo) -> Result<(), SourceError>;
}

/// Handle passed to [`Source::discover_artifacts`].
pub struct DiscoveryContext<'a> {
    execution_id: Uuid,
    cancel: CancellationToken,
    sink: &'a dyn ArtifactSink,
}

impl<'a> DiscoveryContext<'a> {
    /// Creates a context forwarding to `sink`.
    pub fn new(execution_id: Uuid, cancel: CancellationToken, sink: &'a dyn ArtifactSink) -> Self {
        Self {
            execution_id,
            cancel,
            sink,
        }
    }

    /// Identifier of the current run.
    #[must_use]
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Token cancelled when the run should stop.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reports a discovered artifact.
    ///
    /// Blocks until the pipeline has capacity for it.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Cancelled`] once the run is cancelled, which
    /// sources should propagate to end discovery.
    pub async fn discovered(&self, info: ArtifactInfo) -> Result<(), SourceError> {
        if self.cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        self.sink.accept(info).await
    }
}

/// A place artifacts are discovered and downloaded from.
///
/// Implementations must tolerate `download_artifact` being called
/// concurrently for different artifacts.
#[async_trait]
pub trait Source: Send + Sync {
    /// Source type name, used in logs and enrichment.
    fn name(&self) -> &str;

    /// Enumerates artifacts, calling [`DiscoveryContext::discovered`] for each.
    ///
    /// Returns once enumeration is complete. Downloads triggered by
    /// discovered artifacts may still be in flight.
    async fn discover_artifacts(&self, ctx: &DiscoveryContext<'_>) -> Result<(), SourceError>;

    /// Makes one artifact available locally.
    async fn download_artifact(
        &self,
        cancel: &CancellationToken,
        info: ArtifactInfo,
    ) -> Result<DownloadedArtifact, SourceError>;
}
