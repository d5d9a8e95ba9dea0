//! Event bus fanning pipeline events out to registered observers.
//!
//! Every run emits a stream of [`Event`]s, each tagged with the run's
//! execution id:
//!
//! - [`Event::Discovered`] once per artifact found by the source.
//! - [`Event::Downloaded`] once per artifact made available locally.
//! - [`Event::Row`] once per row that survived the mapper chain.
//! - [`Event::Error`] once per artifact that failed.
//!
//! [`EventBus::notify`] delivers an event to every observer in registration
//! order. A failing observer does not stop delivery to the rest; all
//! failures are joined into one [`NotifyError`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use collector_core::events::{EventBus, LoggingObserver};
//!
//! let bus = EventBus::new().with_observer(Arc::new(LoggingObserver::new()));
//! assert_eq!(bus.observer_count(), 1);
//! ```

mod observers;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use crate::error::ErrorList;
use crate::pipeline::{ArtifactInfo, DownloadedArtifact, PipelineError, RowData};
use crate::state::StateSnapshot;

pub use observers::{JsonLinesObserver, LoggingObserver};

/// A pipeline event, tagged with the run that produced it.
#[derive(Debug)]
pub enum Event {
    /// The source found an artifact.
    Discovered {
        /// Run identifier.
        execution_id: Uuid,
        /// The artifact.
        info: ArtifactInfo,
    },
    /// An artifact is available locally.
    Downloaded {
        /// Run identifier.
        execution_id: Uuid,
        /// The downloaded artifact, including any watermark delta.
        artifact: DownloadedArtifact,
    },
    /// A row is ready for delivery.
    Row {
        /// Run identifier.
        execution_id: Uuid,
        /// Name of the artifact the row came from.
        artifact: String,
        /// The row.
        row: RowData,
        /// Collection state as of the row's extraction.
        collection_state: Arc<StateSnapshot>,
    },
    /// Processing one artifact failed.
    Error {
        /// Run identifier.
        execution_id: Uuid,
        /// What went wrong.
        error: PipelineError,
    },
}

impl Event {
    /// Identifier of the run that produced this event.
    #[must_use]
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::Discovered { execution_id, .. }
            | Self::Downloaded { execution_id, .. }
            | Self::Row { execution_id, .. }
            | Self::Error { execution_id, .. } => *execution_id,
        }
    }

    /// Short name of the event kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discovered { .. } => "discovered",
            Self::Downloaded { .. } => "downloaded",
            Self::Row { .. } => "row",
            Self::Error { .. } => "error",
        }
    }
}

/// Errors an observer can return from [`Observer::notify`].
#[derive(Debug, Error)]
pub enum ObserverError {
    /// Writing the event failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing the event failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The observer refused the event.
    #[error("{reason}")]
    Rejected {
        /// Why.
        reason: String,
    },
}

/// One observer's failure during a notification.
#[derive(Debug, Error)]
#[error("observer '{observer}' failed: {source}")]
pub struct ObserverFailure {
    /// Name of the failing observer.
    pub observer: String,
    /// What it returned.
    #[source]
    pub source: ObserverError,
}

/// Joined failures of every observer that failed one notification.
#[derive(Debug, Error)]
#[error("{failures}")]
pub struct NotifyError {
    failures: ErrorList<ObserverFailure>,
}

impl NotifyError {
    /// The individual failures, in observer registration order.
    #[must_use]
    pub fn failures(&self) -> &ErrorList<ObserverFailure> {
        &self.failures
    }
}

/// Receives pipeline events.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        "observer"
    }

    /// Handles one event.
    async fn notify(&self, event: &Event) -> Result<(), ObserverError>;
}

/// Ordered set of observers.
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    /// Creates a bus with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer while building the bus.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.get_mut().push(observer);
        self
    }

    /// Registers an observer. Takes effect for events notified afterwards.
    pub async fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.write().await.push(observer);
    }

    /// Number of registered observers.
    ///
    /// Returns 0 while an `add_observer` call holds the registry.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers
            .try_read()
            .map_or(0, |observers| observers.len())
    }

    /// Delivers an event to every observer in registration order.
    ///
    /// # Errors
    ///
    /// Returns a [`NotifyError`] naming every observer that failed, after
    /// all observers have been called.
    pub async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        let observers = self.observers.read().await.clone();
        trace!(kind = event.kind(), observers = observers.len(), "notifying observers");

        let mut failures = Vec::new();
        for observer in &observers {
            if let Err(source) = observer.notify(event).await {
                failures.push(ObserverFailure {
                    observer: observer.name().to_string(),
                    source,
                });
            }
        }

        match ErrorList::from_vec(failures) {
            None => Ok(()),
            Some(failures) => Err(NotifyError { failures }),
        }
    }
}
