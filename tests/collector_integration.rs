//! Integration tests for the collector.
//!
//! These tests drive full runs against an in-memory source and the local
//! directory source, observing the emitted events and the collection state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use collector_core::events::{Event, EventBus, Observer, ObserverError};
use collector_core::limiter::RateLimiter;
use collector_core::pipeline::{
    ArtifactInfo, Collector, DiscoveryContext, DownloadedArtifact, Enrichment, ExtractFailure,
    Mapper, MapperError, ParseJsonMapper, Payload, PipelineError, RowData, Source, SourceError,
};
use collector_core::sources::{LocalDirectoryConfig, LocalDirectorySource};
use collector_core::state::{CollectionState, LayoutConfig, WatermarkDelta};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const HOURLY: &str = "{year}/{month}/{day}/{hour}/{name}";

fn hour(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
}

// ==================== Test doubles ====================

/// Serves fixed artifacts, writing each into a temp dir on download.
struct MemorySource {
    dir: TempDir,
    artifacts: Vec<(ArtifactInfo, String)>,
    failing: Vec<String>,
    delay: Duration,
    delta: Option<WatermarkDelta>,
    discovery_fails_after: Option<usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemorySource {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
            artifacts: Vec::new(),
            failing: Vec::new(),
            delay: Duration::ZERO,
            delta: None,
            discovery_fails_after: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn artifact(mut self, name: &str, timestamp: Option<DateTime<Utc>>, content: &str) -> Self {
        let mut info =
            ArtifactInfo::new(name).with_enrichment(Enrichment::for_source("memory"));
        if let Some(timestamp) = timestamp {
            info = info.with_timestamp(timestamp);
        }
        self.artifacts.push((info, content.to_string()));
        self
    }

    fn failing(mut self, name: &str) -> Self {
        self.failing.push(name.to_string());
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn delta(mut self, delta: WatermarkDelta) -> Self {
        self.delta = Some(delta);
        self
    }

    fn discovery_fails_after(mut self, reported: usize) -> Self {
        self.discovery_fails_after = Some(reported);
        self
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn discover_artifacts(&self, ctx: &DiscoveryContext<'_>) -> Result<(), SourceError> {
        for (index, (info, _)) in self.artifacts.iter().enumerate() {
            if self.discovery_fails_after == Some(index) {
                return Err(SourceError::other("listing truncated"));
            }
            ctx.discovered(info.clone()).await?;
        }
        Ok(())
    }

    async fn download_artifact(
        &self,
        _cancel: &CancellationToken,
        info: ArtifactInfo,
    ) -> Result<DownloadedArtifact, SourceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&info.name) {
            return Err(SourceError::other("connection reset"));
        }

        let content = self
            .artifacts
            .iter()
            .find(|(known, _)| known.name == info.name)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| SourceError::NotFound {
                name: info.name.clone(),
            })?;
        let path = self.dir.path().join(&info.name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|error| SourceError::io(&path, error))?;

        let downloaded = DownloadedArtifact::new(info, path);
        Ok(match &self.delta {
            Some(delta) => downloaded.with_watermark(delta.clone()),
            None => downloaded,
        })
    }
}

/// What an observer saw, in delivery order.
#[derive(Debug, Clone)]
enum Seen {
    Discovered(String),
    Downloaded(String),
    Row { artifact: String, row: RowData },
    Error(String),
}

#[derive(Default)]
struct RecordingObserver {
    seen: Mutex<Vec<(uuid::Uuid, Seen)>>,
}

impl RecordingObserver {
    fn seen(&self) -> Vec<Seen> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, seen)| seen.clone())
            .collect()
    }

    fn execution_ids(&self) -> Vec<uuid::Uuid> {
        self.seen.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    fn rows(&self) -> Vec<(String, RowData)> {
        self.seen()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Row { artifact, row } => Some((artifact, row)),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Error(artifact) => Some(artifact),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Observer for RecordingObserver {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, event: &Event) -> Result<(), ObserverError> {
        let seen = match event {
            Event::Discovered { info, .. } => Seen::Discovered(info.name.clone()),
            Event::Downloaded { artifact, .. } => Seen::Downloaded(artifact.info.name.clone()),
            Event::Row { artifact, row, .. } => Seen::Row {
                artifact: artifact.clone(),
                row: row.clone(),
            },
            Event::Error { error, .. } => {
                Seen::Error(error.artifact().unwrap_or_default().to_string())
            }
        };
        self.seen.lock().unwrap().push((event.execution_id(), seen));
        Ok(())
    }
}

/// Rejects every row event.
struct RejectingObserver;

#[async_trait]
impl Observer for RejectingObserver {
    async fn notify(&self, event: &Event) -> Result<(), ObserverError> {
        match event {
            Event::Row { .. } => Err(ObserverError::Rejected {
                reason: "sink is full".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Emits each row twice, tagging the copies.
struct DuplicateMapper;

#[async_trait]
impl Mapper for DuplicateMapper {
    fn name(&self) -> &str {
        "duplicate"
    }

    async fn map(
        &self,
        _cancel: &CancellationToken,
        row: RowData,
    ) -> Result<Vec<RowData>, MapperError> {
        let Payload::Json(value) = &row.payload else {
            return Err(MapperError::UnsupportedPayload {
                mapper: "duplicate".to_string(),
                kind: row.payload.kind(),
            });
        };
        let tagged = |copy: u8| {
            let mut value = value.clone();
            value["copy"] = serde_json::json!(copy);
            row.clone().map_payload(Payload::Json(value))
        };
        Ok(vec![tagged(1), tagged(2)])
    }
}

fn hourly_state() -> Arc<CollectionState<LayoutConfig>> {
    Arc::new(CollectionState::new(LayoutConfig::new(HOURLY)).unwrap())
}

fn three_hours() -> MemorySource {
    MemorySource::new()
        .artifact("a.log", Some(hour(1)), "{\"n\":1}\n{\"n\":2}\n")
        .artifact("b.log", Some(hour(2)), "{\"n\":3}\n{\"n\":4}\n")
        .artifact("c.log", Some(hour(3)), "{\"n\":5}\n{\"n\":6}\n")
}

// ==================== Happy path ====================

#[tokio::test]
async fn test_collect_emits_every_row_and_commits() {
    let state = hourly_state();
    let observer = Arc::new(RecordingObserver::default());
    let collector = Collector::builder(Arc::new(three_hours()), Arc::clone(&state))
        .mapper(Arc::new(ParseJsonMapper))
        .event_bus(Arc::new(EventBus::new().with_observer(observer.clone())))
        .build()
        .unwrap();

    let summary = collector.collect(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.discovered, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.downloaded, 3);
    assert_eq!(summary.extracted, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.rows, 6);
    assert!(summary.committed);

    assert!(
        observer
            .execution_ids()
            .iter()
            .all(|id| *id == summary.execution_id)
    );

    let rows = observer.rows();
    assert_eq!(rows.len(), 6);
    for (artifact, row) in &rows {
        assert!(matches!(row.payload, Payload::Json(_)), "{artifact}: {row:?}");
        assert_eq!(row.metadata.as_ref().unwrap().source_type.as_deref(), Some("memory"));
    }
    // Rows of one artifact keep their order.
    let a_rows: Vec<_> = rows
        .iter()
        .filter(|(artifact, _)| artifact == "a.log")
        .map(|(_, row)| row.payload.clone())
        .collect();
    assert_eq!(
        a_rows,
        [
            Payload::Json(serde_json::json!({"n": 1})),
            Payload::Json(serde_json::json!({"n": 2}))
        ]
    );

    // Each artifact is discovered, then downloaded, then emits rows.
    let seen = observer.seen();
    let position = |wanted: &dyn Fn(&Seen) -> bool| seen.iter().position(|s| wanted(s)).unwrap();
    let discovered = position(&|s| matches!(s, Seen::Discovered(name) if name == "b.log"));
    let downloaded = position(&|s| matches!(s, Seen::Downloaded(name) if name == "b.log"));
    let first_row = position(&|s| matches!(s, Seen::Row { artifact, .. } if artifact == "b.log"));
    assert!(discovered < downloaded && downloaded < first_row);

    assert!(!state.is_empty());
    assert!(!state.should_collect(hour(1), "a.log"));
}

#[tokio::test]
async fn test_second_run_skips_collected_artifacts() {
    let state = hourly_state();
    let source: Arc<dyn Source> = Arc::new(three_hours());
    let collector = Collector::builder(Arc::clone(&source), Arc::clone(&state))
        .build()
        .unwrap();

    let first = collector.collect(CancellationToken::new()).await.unwrap();
    assert_eq!(first.downloaded, 3);

    let second = collector.collect(CancellationToken::new()).await.unwrap();
    assert_ne!(second.execution_id, first.execution_id);
    assert_eq!(second.discovered, 3);
    // The earliest hour is settled; the latest ones may still be filling up.
    assert_eq!(second.skipped, 1);
    assert_eq!(second.downloaded, 2);
    assert!(second.committed);
}

#[tokio::test]
async fn test_mapper_fan_out_keeps_artifact_metadata() {
    let observer = Arc::new(RecordingObserver::default());
    let source = MemorySource::new().artifact("a.log", Some(hour(1)), "{\"n\":1}\n{\"n\":2}\n");
    let collector = Collector::builder(Arc::new(source), hourly_state())
        .mapper(Arc::new(ParseJsonMapper))
        .mapper(Arc::new(DuplicateMapper))
        .event_bus(Arc::new(EventBus::new().with_observer(observer.clone())))
        .build()
        .unwrap();

    let summary = collector.collect(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.rows, 4);

    let copies: Vec<_> = observer
        .rows()
        .into_iter()
        .map(|(_, row)| {
            assert_eq!(row.metadata, Some(Enrichment::for_source("memory")));
            match row.payload {
                Payload::Json(value) => (value["n"].as_i64().unwrap(), value["copy"].as_i64().unwrap()),
                other => panic!("unexpected payload {other:?}"),
            }
        })
        .collect();
    assert_eq!(copies, [(1, 1), (1, 2), (2, 1), (2, 2)]);
}

#[tokio::test]
async fn test_artifact_without_timestamp_is_always_collected() {
    let state = hourly_state();
    let source: Arc<dyn Source> =
        Arc::new(MemorySource::new().artifact("listing.json", None, "{\"n\":1}\n"));
    let collector = Collector::builder(source, Arc::clone(&state)).build().unwrap();

    for _ in 0..2 {
        let summary = collector.collect(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.rows, 1);
    }
    assert!(state.is_empty());
}

#[tokio::test]
async fn test_watermark_delta_is_recorded() {
    let state = hourly_state();
    let mut delta = WatermarkDelta::new();
    for (h, id) in [(1, "evt-1"), (3, "evt-3"), (5, "evt-5")] {
        delta.push(hour(h), id);
    }
    let source = MemorySource::new()
        .artifact("events.json", None, "{\"n\":1}\n")
        .delta(delta);
    let collector = Collector::builder(Arc::new(source), Arc::clone(&state))
        .build()
        .unwrap();

    let summary = collector.collect(CancellationToken::new()).await.unwrap();
    assert!(summary.committed);
    assert!(!state.should_collect(hour(1), "evt-1"));
    assert!(!state.should_collect(hour(2), "evt-2"));
    assert!(state.should_collect(hour(5), "evt-6"));
}

// ==================== Limits ====================

#[tokio::test]
async fn test_max_concurrency_bounds_downloads() {
    let source = Arc::new(three_hours().delay(Duration::from_millis(20)));
    let collector = Collector::builder(source.clone(), hourly_state())
        .limiter(RateLimiter::new(None, Some(1)).unwrap())
        .build()
        .unwrap();

    let summary = collector.collect(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.downloaded, 3);
    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unlimited_downloads_overlap() {
    let source = Arc::new(three_hours().delay(Duration::from_millis(50)));
    let collector = Collector::builder(source.clone(), hourly_state())
        .build()
        .unwrap();

    collector.collect(CancellationToken::new()).await.unwrap();
    assert!(source.max_in_flight.load(Ordering::SeqCst) > 1);
}

// ==================== Failures ====================

#[tokio::test]
async fn test_failed_download_is_reported_and_blocks_commit() {
    let state = hourly_state();
    let observer = Arc::new(RecordingObserver::default());
    let source = Arc::new(three_hours().failing("b.log").delay(Duration::from_millis(20)));
    let collector = Collector::builder(source.clone(), Arc::clone(&state))
        .limiter(RateLimiter::new(None, Some(1)).unwrap())
        .event_bus(Arc::new(EventBus::new().with_observer(observer.clone())))
        .build()
        .unwrap();

    let summary = collector.collect(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.rows, 4);
    assert!(!summary.committed);
    assert_eq!(observer.errors(), ["b.log"]);
    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    // The whole run is retried next time.
    assert!(state.is_empty());
    assert!(state.should_collect(hour(1), "a.log"));
}

#[tokio::test]
async fn test_discovery_failure_fails_run_after_dispatched_artifacts_finish() {
    let state = hourly_state();
    let observer = Arc::new(RecordingObserver::default());
    let source = three_hours()
        .delay(Duration::from_millis(20))
        .discovery_fails_after(2);
    let collector = Collector::builder(Arc::new(source), Arc::clone(&state))
        .event_bus(Arc::new(EventBus::new().with_observer(observer.clone())))
        .build()
        .unwrap();

    let err = collector.collect(CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(err, PipelineError::Discovery(SourceError::Other { .. })),
        "got {err:?}"
    );

    // Artifacts reported before the failure still ran to completion.
    let seen = observer.seen();
    for name in ["a.log", "b.log"] {
        assert!(seen.iter().any(|s| matches!(s, Seen::Downloaded(n) if n == name)));
    }
    assert!(!seen.iter().any(|s| matches!(s, Seen::Discovered(n) if n == "c.log")));
    assert_eq!(observer.rows().len(), 4);

    // Progress of the partial run is abandoned.
    assert!(state.is_empty());
    assert!(state.should_collect(hour(1), "a.log"));
}

#[tokio::test]
async fn test_unreadable_artifact_fails_extraction() {
    let observer = Arc::new(RecordingObserver::default());
    let source = MemorySource::new()
        .artifact("good.log", Some(hour(1)), "{\"n\":1}\n")
        .artifact("bad.log.gz", Some(hour(2)), "not gzip at all");
    let collector = Collector::builder(Arc::new(source), hourly_state())
        .event_bus(Arc::new(EventBus::new().with_observer(observer.clone())))
        .build()
        .unwrap();

    let summary = collector.collect(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(observer.errors(), ["bad.log.gz"]);
}

#[tokio::test]
async fn test_mapper_error_fails_artifact_but_emits_other_rows() {
    let observer = Arc::new(RecordingObserver::default());
    let source = MemorySource::new().artifact("mixed.log", Some(hour(1)), "{\"n\":1}\nnot json\n{\"n\":3}\n");
    let collector = Collector::builder(Arc::new(source), hourly_state())
        .mapper(Arc::new(ParseJsonMapper))
        .event_bus(Arc::new(EventBus::new().with_observer(observer.clone())))
        .build()
        .unwrap();

    let summary = collector.collect(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.rows, 2);
    assert_eq!(summary.failed, 1);
    assert!(!summary.committed);
    assert_eq!(observer.errors(), ["mixed.log"]);
}

#[tokio::test]
async fn test_observer_rejection_fails_artifact() {
    let state = hourly_state();
    let errors = Arc::new(Mutex::new(Vec::new()));

    /// Records "artifact:emit failures" for every extraction error.
    struct ErrorCollector(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Observer for ErrorCollector {
        async fn notify(&self, event: &Event) -> Result<(), ObserverError> {
            if let Event::Error {
                error: PipelineError::Extraction { artifact, errors },
                ..
            } = event
            {
                let emit_failures = errors
                    .iter()
                    .filter(|failure| matches!(failure, ExtractFailure::Emit(_)))
                    .count();
                self.0
                    .lock()
                    .unwrap()
                    .push(format!("{artifact}:{emit_failures}"));
            }
            Ok(())
        }
    }

    let bus = EventBus::new()
        .with_observer(Arc::new(RejectingObserver))
        .with_observer(Arc::new(ErrorCollector(Arc::clone(&errors))));
    let source = MemorySource::new().artifact("a.log", Some(hour(1)), "one\ntwo\n");
    let collector = Collector::builder(Arc::new(source), Arc::clone(&state))
        .event_bus(Arc::new(bus))
        .build()
        .unwrap();

    let summary = collector.collect(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.rows, 0);
    assert_eq!(summary.failed, 1);
    assert!(state.is_empty());

    assert_eq!(*errors.lock().unwrap(), ["a.log:2"]);
}

#[tokio::test]
async fn test_cancelled_run_returns_cancelled_and_commits_nothing() {
    let state = hourly_state();
    let collector = Collector::builder(Arc::new(three_hours()), Arc::clone(&state))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = collector.collect(cancel).await.unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled), "got {err:?}");
    assert!(state.is_empty());
}

#[tokio::test]
async fn test_zero_queue_capacity_is_rejected() {
    let err = Collector::builder(Arc::new(three_hours()), hourly_state())
        .queue_capacity(0)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidSetting {
            field: "queue_capacity",
            ..
        }
    ));
}

// ==================== Local directory ====================

fn write_daily_logs(root: &std::path::Path, days: std::ops::RangeInclusive<u32>) {
    for day in days {
        let dir = root.join(format!("2024/05/{day:02}"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("app.log"),
            format!("{{\"day\":{day},\"line\":1}}\n{{\"day\":{day},\"line\":2}}\n"),
        )
        .unwrap();
    }
}

async fn collect_local(
    config: &LocalDirectoryConfig,
    state_path: &std::path::Path,
    observer: Arc<RecordingObserver>,
) -> collector_core::pipeline::CollectSummary {
    let state = Arc::new(CollectionState::init(config.clone(), state_path).unwrap());
    let source = Arc::new(LocalDirectorySource::new(config.clone()).unwrap());
    let collector = Collector::builder(source, state)
        .mapper(Arc::new(ParseJsonMapper))
        .limiter(RateLimiter::new(None, Some(2)).unwrap())
        .event_bus(Arc::new(EventBus::new().with_observer(observer)))
        .build()
        .unwrap();
    collector.collect(CancellationToken::new()).await.unwrap()
}

#[tokio::test]
async fn test_local_directory_runs_are_incremental_across_restarts() {
    let logs = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    let state_path = state_dir.path().join("app.json");
    write_daily_logs(logs.path(), 1..=4);

    let config = LocalDirectoryConfig::new(logs.path())
        .with_file_layout("{year}/{month}/{day}/{name}.log")
        .with_source_name("app");

    let observer = Arc::new(RecordingObserver::default());
    let first = collect_local(&config, &state_path, observer.clone()).await;
    assert_eq!(first.downloaded, 4);
    assert_eq!(first.rows, 8);
    assert!(first.committed);
    assert!(state_path.exists());

    let (_, row) = &observer.rows()[0];
    let metadata = row.metadata.as_ref().unwrap();
    assert_eq!(metadata.source_type.as_deref(), Some("local_directory"));
    assert_eq!(metadata.source_name.as_deref(), Some("app"));

    // Days 1 and 2 are settled; day 3 is the end boundary and day 4 the
    // still-open window, so both are collected again.
    let observer = Arc::new(RecordingObserver::default());
    let second = collect_local(&config, &state_path, observer.clone()).await;
    assert_eq!(second.discovered, 4);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.downloaded, 2);
    assert_eq!(second.rows, 4);
    let mut artifacts: Vec<_> = observer.rows().into_iter().map(|(name, _)| name).collect();
    artifacts.sort();
    artifacts.dedup();
    assert_eq!(artifacts, ["2024/05/03/app.log", "2024/05/04/app.log"]);

    write_daily_logs(logs.path(), 5..=5);
    let third = collect_local(&config, &state_path, Arc::new(RecordingObserver::default())).await;
    assert_eq!(third.discovered, 5);
    assert_eq!(third.skipped, 2);
    assert_eq!(third.downloaded, 3);
}
