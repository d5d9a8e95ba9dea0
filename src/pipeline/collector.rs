//! The collector drives one source through discovery, download, loading,
//! mapping and emission.
//!
//! # Concurrency model
//!
//! - Discovery runs on the caller's task. Each discovered artifact is
//!   checked against the collection state, then waits for a limiter permit
//!   before its download task is spawned, so a slow pipeline slows discovery.
//! - Each download runs in its own task and releases its permit as soon as
//!   the download finishes.
//! - Extraction runs in a further task: a loader task fills a bounded row
//!   queue which is drained through the mapper chain and out to observers.
//! - A [`CompletionCounter`] guard travels with every artifact and is
//!   released exactly once, after the artifact's final event.
//! - Collected artifacts are recorded in the collection state in discovery
//!   order through a [`CommitSequencer`], whatever order they finish in.
//!
//! A failed artifact never stops the run. The run's watermark progress is
//! committed only when every artifact succeeded.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, instrument, warn};
use uuid::Uuid;

use super::artifact::{ArtifactInfo, DownloadedArtifact};
use super::completion::{CompletionCounter, CompletionGuard};
use super::error::{ExtractFailure, LoaderError, PipelineError, SourceError};
use super::loader::{DEFAULT_QUEUE_CAPACITY, Loader, LoaderResolver, row_queue};
use super::mapper::{Mapper, MapperChain};
use super::sequencer::{CommitSequencer, CommitTicket};
use super::source::{ArtifactSink, DiscoveryContext, Source};
use crate::config::{ConfigError, PipelineConfig};
use crate::error::ErrorList;
use crate::events::{Event, EventBus};
use crate::limiter::{LimiterPermit, RateLimiter};
use crate::state::{CollectionState, StateConfig};

/// Counts from one collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectSummary {
    /// Identifier shared by every event of the run.
    pub execution_id: Uuid,
    /// Artifacts reported by the source.
    pub discovered: usize,
    /// Artifacts skipped as already collected.
    pub skipped: usize,
    /// Artifacts downloaded.
    pub downloaded: usize,
    /// Artifacts whose rows were all emitted.
    pub extracted: usize,
    /// Artifacts that failed at any stage.
    pub failed: usize,
    /// Rows delivered to observers.
    pub rows: usize,
    /// Whether the run's watermark progress was committed.
    pub committed: bool,
}

#[derive(Debug, Default)]
struct RunStats {
    discovered: AtomicUsize,
    skipped: AtomicUsize,
    downloaded: AtomicUsize,
    extracted: AtomicUsize,
    failed: AtomicUsize,
    rows: AtomicUsize,
}

impl RunStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    fn summary(&self, execution_id: Uuid, committed: bool) -> CollectSummary {
        CollectSummary {
            execution_id,
            discovered: self.discovered.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            downloaded: self.downloaded.load(Ordering::SeqCst),
            extracted: self.extracted.load(Ordering::SeqCst),
            failed: self.failed(),
            rows: self.rows.load(Ordering::SeqCst),
            committed,
        }
    }
}

/// Builder for a [`Collector`].
pub struct CollectorBuilder<C: StateConfig> {
    source: Arc<dyn Source>,
    state: Arc<CollectionState<C>>,
    loader: Option<Arc<dyn Loader>>,
    row_per_line: bool,
    mappers: MapperChain,
    limiter: Option<RateLimiter>,
    bus: Option<Arc<EventBus>>,
    queue_capacity: usize,
}

impl<C: StateConfig> CollectorBuilder<C> {
    /// Uses `loader` for every artifact instead of inferring one.
    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Whether inferred loaders emit one row per line (default) or one row
    /// per artifact.
    #[must_use]
    pub fn row_per_line(mut self, row_per_line: bool) -> Self {
        self.row_per_line = row_per_line;
        self
    }

    /// Appends a mapper stage.
    #[must_use]
    pub fn mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mappers.push(mapper);
        self
    }

    /// Replaces the mapper chain.
    #[must_use]
    pub fn mappers(mut self, mappers: MapperChain) -> Self {
        self.mappers = mappers;
        self
    }

    /// Sets the limiter. Defaults to [`RateLimiter::disabled`].
    #[must_use]
    pub fn limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Sets the event bus. Defaults to a bus with no observers.
    #[must_use]
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Bound of the row queue between loader and mapper chain.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Applies limiter and loading settings from a pipeline configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn configure(self, config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(self
            .limiter(config.build_limiter()?)
            .row_per_line(config.row_per_line)
            .queue_capacity(config.queue_capacity))
    }

    /// Builds the collector.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidSetting`] for a zero queue capacity.
    pub fn build(self) -> Result<Collector<C>, PipelineError> {
        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidSetting {
                field: "queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        let loaders = match self.loader {
            Some(loader) => LoaderResolver::explicit(loader),
            None => LoaderResolver::inferred(self.row_per_line),
        };

        Ok(Collector {
            source: self.source,
            state: self.state,
            loaders: Arc::new(loaders),
            mappers: Arc::new(self.mappers),
            limiter: Arc::new(self.limiter.unwrap_or_else(RateLimiter::disabled)),
            bus: self.bus.unwrap_or_default(),
            queue_capacity: self.queue_capacity,
        })
    }
}

/// Runs collection for one source against one collection state.
pub struct Collector<C: StateConfig> {
    source: Arc<dyn Source>,
    state: Arc<CollectionState<C>>,
    loaders: Arc<LoaderResolver>,
    mappers: Arc<MapperChain>,
    limiter: Arc<RateLimiter>,
    bus: Arc<EventBus>,
    queue_capacity: usize,
}

impl<C: StateConfig> std::fmt::Debug for Collector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("source", &self.source.name())
            .field("loaders", &self.loaders)
            .field("mappers", &self.mappers)
            .field("limiter", &self.limiter)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl<C: StateConfig> Collector<C> {
    /// Starts building a collector.
    #[must_use]
    pub fn builder(source: Arc<dyn Source>, state: Arc<CollectionState<C>>) -> CollectorBuilder<C> {
        CollectorBuilder {
            source,
            state,
            loader: None,
            row_per_line: true,
            mappers: MapperChain::new(),
            limiter: None,
            bus: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// The event bus observers register with.
    #[must_use]
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The collection state.
    #[must_use]
    pub fn state(&self) -> &Arc<CollectionState<C>> {
        &self.state
    }

    /// Runs one collection: discover, download, extract and emit every
    /// artifact not yet collected, then save the collection state.
    ///
    /// Returns after every discovered artifact reached a terminal state.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Discovery`] if the source failed to enumerate.
    /// - [`PipelineError::Cancelled`] if `cancel` fired.
    /// - [`PipelineError::State`] if saving the collection state failed.
    ///
    /// Per-artifact failures are reported as [`Event::Error`] and counted in
    /// [`CollectSummary::failed`]; they do not fail the run.
    #[instrument(skip_all, fields(source = %self.source.name()))]
    pub async fn collect(&self, cancel: CancellationToken) -> Result<CollectSummary, PipelineError> {
        let execution_id = Uuid::new_v4();
        let commits = {
            let state = Arc::clone(&self.state);
            Arc::new(CommitSequencer::new(move |timestamp, id| {
                state.on_collected(timestamp, id);
            }))
        };
        let run = Arc::new(Run {
            execution_id,
            cancel: cancel.clone(),
            source: Arc::clone(&self.source),
            state: Arc::clone(&self.state),
            loaders: Arc::clone(&self.loaders),
            mappers: Arc::clone(&self.mappers),
            limiter: Arc::clone(&self.limiter),
            bus: Arc::clone(&self.bus),
            queue_capacity: self.queue_capacity,
            counter: Arc::new(CompletionCounter::new()),
            commits,
            stats: RunStats::default(),
        });

        info!(%execution_id, "collection run started");
        self.state.start_collection();

        let sink = RunSink {
            run: Arc::clone(&run),
        };
        let discovery = {
            let ctx = DiscoveryContext::new(execution_id, cancel.clone(), &sink);
            self.source.discover_artifacts(&ctx).await
        };

        debug!(
            pending = run.counter.pending(),
            "discovery finished, waiting for in-flight artifacts"
        );
        run.counter.wait_idle().await;

        let outcome = if cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            match discovery {
                Ok(()) => Ok(()),
                Err(SourceError::Cancelled) => Err(PipelineError::Cancelled),
                Err(error) => Err(PipelineError::Discovery(error)),
            }
        };

        let failed = run.stats.failed();
        let committed = if outcome.is_ok() && failed == 0 {
            self.state.end_collection()
        } else {
            self.state.abandon_collection();
            if outcome.is_ok() {
                warn!(%execution_id, failed, "artifacts failed, watermark progress not committed");
            }
            false
        };

        let saved = self.state.save();
        let summary = run.stats.summary(execution_id, committed);

        match (outcome, saved) {
            (Err(error), saved) => {
                if let Err(save_error) = saved {
                    warn!(%execution_id, error = %save_error, "failed to save collection state");
                }
                warn!(%execution_id, %error, "collection run failed");
                Err(error)
            }
            (Ok(()), Err(save_error)) => Err(save_error.into()),
            (Ok(()), Ok(_)) => {
                info!(
                    %execution_id,
                    discovered = summary.discovered,
                    skipped = summary.skipped,
                    downloaded = summary.downloaded,
                    failed = summary.failed,
                    rows = summary.rows,
                    committed,
                    "collection run complete"
                );
                Ok(summary)
            }
        }
    }
}

/// Everything one run's tasks share.
struct Run<C: StateConfig> {
    execution_id: Uuid,
    cancel: CancellationToken,
    source: Arc<dyn Source>,
    state: Arc<CollectionState<C>>,
    loaders: Arc<LoaderResolver>,
    mappers: Arc<MapperChain>,
    limiter: Arc<RateLimiter>,
    bus: Arc<EventBus>,
    queue_capacity: usize,
    counter: Arc<CompletionCounter>,
    commits: Arc<CommitSequencer>,
    stats: RunStats,
}

/// An artifact that has not reached a terminal state.
///
/// Fields drop in order, so the commit ticket resolves before the
/// completion guard releases.
struct InFlight {
    ticket: CommitTicket,
    guard: CompletionGuard,
}

impl InFlight {
    /// Records the artifact as collected and releases it.
    fn finish(self, info: &ArtifactInfo) {
        let Self { ticket, guard } = self;
        match info.timestamp {
            Some(timestamp) => ticket.commit(timestamp, info.name.as_str()),
            None => drop(ticket),
        }
        drop(guard);
    }
}

impl<C: StateConfig> Run<C> {
    /// Notifies observers of a lifecycle event. Observer failures are logged.
    async fn emit(&self, event: Event) {
        if let Err(error) = self.bus.notify(&event).await {
            warn!(execution_id = %self.execution_id, kind = event.kind(), %error, "observers failed to handle event");
        }
    }

    /// Records and reports a failed artifact, then releases it.
    async fn fail(&self, error: PipelineError, artifact: InFlight) {
        RunStats::bump(&self.stats.failed);
        debug!(artifact = ?error.artifact(), %error, "artifact failed");
        self.emit(Event::Error {
            execution_id: self.execution_id,
            error,
        })
        .await;
        drop(artifact);
    }

    async fn download(self: Arc<Self>, info: ArtifactInfo, permit: LimiterPermit, artifact: InFlight) {
        let name = info.name.clone();
        let result = AssertUnwindSafe(self.source.download_artifact(&self.cancel, info))
            .catch_unwind()
            .await;
        permit.release();

        let downloaded = match result {
            Ok(Ok(downloaded)) => downloaded,
            Ok(Err(source)) => {
                let error = PipelineError::Download {
                    artifact: name,
                    source,
                };
                return self.fail(error, artifact).await;
            }
            Err(panic) => {
                let error = PipelineError::TaskPanicked {
                    artifact: name,
                    message: panic_message(panic.as_ref()),
                };
                return self.fail(error, artifact).await;
            }
        };

        RunStats::bump(&self.stats.downloaded);
        debug!(path = %downloaded.local_path.display(), "artifact downloaded");
        if let Some(delta) = &downloaded.watermark {
            self.state.apply_delta(delta);
        }
        self.emit(Event::Downloaded {
            execution_id: self.execution_id,
            artifact: downloaded.clone(),
        })
        .await;

        let span = tracing::Span::current();
        tokio::spawn(self.extract(downloaded, artifact).instrument(span));
    }

    async fn extract(self: Arc<Self>, downloaded: DownloadedArtifact, artifact: InFlight) {
        let result = AssertUnwindSafe(self.extract_rows(&downloaded))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(rows)) => {
                RunStats::bump(&self.stats.extracted);
                debug!(rows, "artifact extracted");
                artifact.finish(&downloaded.info);
            }
            Ok(Err(error)) => self.fail(error, artifact).await,
            Err(panic) => {
                let error = PipelineError::TaskPanicked {
                    artifact: downloaded.info.name,
                    message: panic_message(panic.as_ref()),
                };
                self.fail(error, artifact).await;
            }
        }
    }

    /// Loads, maps and emits every row of one artifact.
    async fn extract_rows(&self, artifact: &DownloadedArtifact) -> Result<usize, PipelineError> {
        let loader = self.loaders.resolve(artifact);
        let (sender, mut receiver) = row_queue(self.queue_capacity);

        let producer = {
            let artifact = artifact.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(error) = loader.load(&cancel, &artifact, sender.clone()).await
                    && !sender.fail(error).await
                {
                    debug!("row consumer gone before load error was delivered");
                }
            })
        };

        let mut failures: Vec<ExtractFailure> = Vec::new();
        let mut emitted = 0;
        while let Some(message) = receiver.recv().await {
            let raw = match message {
                Ok(row) => row,
                Err(error) => {
                    failures.push(error.into());
                    break;
                }
            };

            let output = self.mappers.apply(&self.cancel, vec![raw]).await;
            failures.extend(output.errors.into_iter().map(ExtractFailure::from));
            if output.rows.is_empty() {
                continue;
            }

            let snapshot = Arc::new(self.state.snapshot());
            for mut row in output.rows {
                if row.metadata.is_none() {
                    row.metadata = Some(artifact.info.enrichment.clone());
                }
                let event = Event::Row {
                    execution_id: self.execution_id,
                    artifact: artifact.info.name.clone(),
                    row,
                    collection_state: Arc::clone(&snapshot),
                };
                match self.bus.notify(&event).await {
                    Ok(()) => emitted += 1,
                    Err(error) => failures.push(error.into()),
                }
            }
        }
        drop(receiver);

        if let Err(error) = producer.await {
            failures.push(
                LoaderError::TaskFailed {
                    message: error.to_string(),
                }
                .into(),
            );
        }
        self.stats.rows.fetch_add(emitted, Ordering::SeqCst);

        match ErrorList::from_vec(failures) {
            None => Ok(emitted),
            Some(errors) => Err(PipelineError::Extraction {
                artifact: artifact.info.name.clone(),
                errors,
            }),
        }
    }
}

/// Receives artifacts from discovery and dispatches them.
struct RunSink<C: StateConfig> {
    run: Arc<Run<C>>,
}

#[async_trait]
impl<C: StateConfig> ArtifactSink for RunSink<C> {
    async fn accept(&self, info: ArtifactInfo) -> Result<(), SourceError> {
        let run = &self.run;
        let artifact = InFlight {
            ticket: run.commits.ticket(),
            guard: run.counter.track(),
        };
        RunStats::bump(&run.stats.discovered);

        run.emit(Event::Discovered {
            execution_id: run.execution_id,
            info: info.clone(),
        })
        .await;

        if let Some(timestamp) = info.timestamp
            && !run.state.should_collect(timestamp, &info.name)
        {
            debug!(artifact = %info.name, %timestamp, "artifact already collected, skipping");
            RunStats::bump(&run.stats.skipped);
            return Ok(());
        }

        let permit = tokio::select! {
            permit = run.limiter.acquire() => permit,
            () = run.cancel.cancelled() => return Err(SourceError::Cancelled),
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(source) => {
                let error = PipelineError::Limiter {
                    artifact: info.name,
                    source,
                };
                run.fail(error, artifact).await;
                return Ok(());
            }
        };

        let span = debug_span!("artifact", name = %info.name);
        tokio::spawn(Arc::clone(run).download(info, permit, artifact).instrument(span));
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
