//! Persistent, lock-guarded collection state for one table partition.

use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::StateError;
use super::granularity::Granularity;
use super::lock::StateFileLock;
use super::template::FileLayout;
use super::time_range::{CollectionOrder, RangeTracker, TimeRange};

/// Current on-disk format version.
const STATE_FORMAT_VERSION: u32 = 1;

/// Source configuration a collection state is derived from.
///
/// Implemented by each source's configuration type so the state engine can be
/// parameterized over it.
pub trait StateConfig: Send + Sync + 'static {
    /// Layout template whose time fields set the granularity.
    ///
    /// `None` means names carry no timing and granularity is zero.
    fn file_layout(&self) -> Option<&str>;

    /// Order in which the source walks through time.
    fn order(&self) -> CollectionOrder {
        CollectionOrder::Chronological
    }

    /// Whether each run continues where the previous run stopped.
    fn has_continuation(&self) -> bool {
        false
    }
}

/// Minimal [`StateConfig`] built from a layout template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Layout template, if artifact names carry timing.
    #[serde(default)]
    pub file_layout: Option<String>,
    /// Collection order.
    #[serde(default)]
    pub order: CollectionOrder,
    /// Continuation flag.
    #[serde(default)]
    pub has_continuation: bool,
}

impl LayoutConfig {
    /// Chronological, non-continuing config for a layout.
    #[must_use]
    pub fn new(file_layout: impl Into<String>) -> Self {
        Self {
            file_layout: Some(file_layout.into()),
            ..Self::default()
        }
    }

    /// Config for names without timing (granularity zero).
    #[must_use]
    pub fn untimed() -> Self {
        Self::default()
    }

    /// Sets order and continuation.
    #[must_use]
    pub fn with_mode(mut self, order: CollectionOrder, has_continuation: bool) -> Self {
        self.order = order;
        self.has_continuation = has_continuation;
        self
    }
}

impl StateConfig for LayoutConfig {
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

/// One collected `(timestamp, identifier)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// When the item occurred.
    pub timestamp: DateTime<Utc>,
    /// Item identifier, unique among items sharing a timestamp.
    pub id: String,
}

/// Watermark progress reported by a source alongside a download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkDelta {
    observations: Vec<Observation>,
}

impl WatermarkDelta {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observation.
    pub fn push(&mut self, timestamp: DateTime<Utc>, id: impl Into<String>) {
        self.observations.push(Observation {
            timestamp,
            id: id.into(),
        });
    }

    /// Observations in report order.
    #[must_use]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Whether the delta carries no progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

impl FromIterator<Observation> for WatermarkDelta {
    fn from_iter<I: IntoIterator<Item = Observation>>(iter: I) -> Self {
        Self {
            observations: iter.into_iter().collect(),
        }
    }
}

/// Point-in-time copy of a collection state, attached to emitted rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    /// Granularity in effect.
    pub granularity: Granularity,
    /// Collection order.
    pub order: CollectionOrder,
    /// Continuation flag.
    pub has_continuation: bool,
    /// Committed ranges.
    pub ranges: Vec<TimeRange>,
    /// Provisional range of the active run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisional: Option<TimeRange>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_modified_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    tracker: RangeTracker,
}

#[derive(Debug)]
struct StateInner {
    tracker: RangeTracker,
    /// Bumped on every mutation.
    version: u64,
    /// Value of `version` at the last successful save.
    saved_version: u64,
    last_modified_time: Option<DateTime<Utc>>,
    last_saved_time: Option<DateTime<Utc>>,
}

impl StateInner {
    fn touch(&mut self) {
        self.version += 1;
        self.last_modified_time = Some(Utc::now());
    }
}

/// Collection state for one table partition, parameterized over its source config.
///
/// All reads and mutations go through one read/write lock. Persistence is a
/// single JSON file; see [`CollectionState::init`] and [`CollectionState::save`].
#[derive(Debug)]
pub struct CollectionState<C> {
    config: C,
    path: Option<PathBuf>,
    inner: RwLock<StateInner>,
    _file_lock: Option<StateFileLock>,
}

impl<C: StateConfig> CollectionState<C> {
    /// Creates an in-memory state that is never persisted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidLayout`] if the config's layout is invalid.
    pub fn new(config: C) -> Result<Self, StateError> {
        let tracker = fresh_tracker(&config)?;
        Ok(Self::from_parts(config, None, tracker, None, None))
    }

    /// Loads state from `path`, or starts fresh if the file does not exist.
    ///
    /// Takes an exclusive advisory lock on `<path>.lock` held until the state
    /// is dropped. A malformed file is an error and is left in place.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Locked`] if another run holds the state,
    /// [`StateError::Malformed`] or [`StateError::UnsupportedVersion`] for an
    /// unreadable file, [`StateError::InvalidRanges`] for inconsistent ranges,
    /// and [`StateError::Io`] for file system failures.
    #[instrument(skip(config, path), fields(path = %path.as_ref().display()))]
    pub fn init(config: C, path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let file_lock = StateFileLock::acquire(&path)?;

        let bytes = match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(error) => return Err(StateError::io(&path, error)),
        };

        let Some(bytes) = bytes else {
            info!("no collection state file; starting fresh");
            let tracker = fresh_tracker(&config)?;
            return Ok(Self::from_parts(config, Some(path), tracker, None, Some(file_lock)));
        };

        let persisted: PersistedState =
            serde_json::from_slice(&bytes).map_err(|source| StateError::Malformed {
                path: path.clone(),
                source,
            })?;
        if persisted.version != STATE_FORMAT_VERSION {
            return Err(StateError::UnsupportedVersion {
                path,
                version: persisted.version,
            });
        }

        let mut tracker = persisted.tracker;
        tracker.validate()?;

        let granularity = config_granularity(&config)?;
        if granularity != tracker.granularity() {
            warn!(
                persisted_secs = tracker.granularity().as_secs(),
                configured_secs = granularity.as_secs(),
                "file layout granularity changed; using configured granularity"
            );
            tracker.set_granularity(granularity);
        }
        tracker.set_mode(config.order(), config.has_continuation());

        info!(
            ranges = tracker.ranges().len(),
            granularity_secs = tracker.granularity().as_secs(),
            "loaded collection state"
        );
        Ok(Self::from_parts(
            config,
            Some(path),
            tracker,
            persisted.last_modified_time,
            Some(file_lock),
        ))
    }

    fn from_parts(
        config: C,
        path: Option<PathBuf>,
        tracker: RangeTracker,
        last_modified_time: Option<DateTime<Utc>>,
        file_lock: Option<StateFileLock>,
    ) -> Self {
        Self {
            config,
            path,
            inner: RwLock::new(StateInner {
                tracker,
                version: 0,
                saved_version: 0,
                last_modified_time,
                last_saved_time: None,
            }),
            _file_lock: file_lock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StateInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Source configuration this state was built from.
    #[must_use]
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Backing file, if persisted.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Granularity in effect.
    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.read().tracker.granularity()
    }

    /// Whether no progress has ever been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().tracker.is_empty()
    }

    /// When the state last changed.
    #[must_use]
    pub fn last_modified_time(&self) -> Option<DateTime<Utc>> {
        self.read().last_modified_time
    }

    /// When the state was last written to disk by this instance.
    #[must_use]
    pub fn last_saved_time(&self) -> Option<DateTime<Utc>> {
        self.read().last_saved_time
    }

    /// Whether the item at `timestamp` with `id` still needs collecting.
    #[must_use]
    pub fn should_collect(&self, timestamp: DateTime<Utc>, id: &str) -> bool {
        self.read().tracker.should_collect(timestamp, id)
    }

    /// Records that the item at `timestamp` with `id` was collected.
    pub fn on_collected(&self, timestamp: DateTime<Utc>, id: &str) {
        let mut inner = self.write();
        inner.tracker.on_collected(timestamp, id);
        inner.touch();
    }

    /// Records every observation in a source-reported delta.
    pub fn apply_delta(&self, delta: &WatermarkDelta) {
        if delta.is_empty() {
            return;
        }
        let mut inner = self.write();
        for observation in delta.observations() {
            inner
                .tracker
                .on_collected(observation.timestamp, &observation.id);
        }
        inner.touch();
    }

    /// Opens the provisional range for a run.
    pub fn start_collection(&self) {
        self.write().tracker.start_collection();
    }

    /// Commits the run's provisional range. Call only after a fully successful run.
    ///
    /// Returns `true` if committed ranges changed.
    pub fn end_collection(&self) -> bool {
        let mut inner = self.write();
        let changed = inner.tracker.end_collection();
        if changed {
            inner.touch();
        }
        changed
    }

    /// Discards the run's provisional range.
    pub fn abandon_collection(&self) {
        self.write().tracker.abandon_collection();
    }

    /// Forgets progress from `from` onwards, or all progress for `None`.
    pub fn reset(&self, from: Option<DateTime<Utc>>) {
        let mut inner = self.write();
        inner.tracker.reset(from);
        inner.touch();
        info!(from = ?from, "collection state reset");
    }

    /// Copies the current state, including the provisional range.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.read();
        StateSnapshot {
            granularity: inner.tracker.granularity(),
            order: inner.tracker.order(),
            has_continuation: inner.tracker.has_continuation(),
            ranges: inner.tracker.ranges().to_vec(),
            provisional: inner.tracker.provisional().cloned(),
        }
    }

    /// Writes committed state to the backing file.
    ///
    /// Skipped when nothing changed since the last save, or when the state is
    /// in-memory only. Returns `true` if the file was written. The write lock
    /// is held for the whole write so the file is a consistent snapshot; a
    /// failed save leaves in-memory progress intact for the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] or [`StateError::Serialize`] on failure.
    #[instrument(skip(self), fields(path = ?self.path))]
    pub fn save(&self) -> Result<bool, StateError> {
        let Some(path) = &self.path else {
            debug!("in-memory collection state; nothing to save");
            return Ok(false);
        };

        let mut inner = self.write();
        if inner.version == inner.saved_version && inner.last_saved_time.is_some() {
            debug!("collection state unchanged since last save");
            return Ok(false);
        }

        let persisted = PersistedState {
            version: STATE_FORMAT_VERSION,
            last_modified_time: inner.last_modified_time,
            tracker: inner.tracker.clone(),
        };
        write_atomically(path, &persisted)?;

        inner.saved_version = inner.version;
        inner.last_saved_time = Some(Utc::now());
        debug!(ranges = inner.tracker.ranges().len(), "collection state saved");
        Ok(true)
    }
}

fn config_granularity<C: StateConfig>(config: &C) -> Result<Granularity, StateError> {
    config
        .file_layout()
        .map(FileLayout::parse)
        .transpose()
        .map(|layout| layout.map_or(Granularity::ZERO, |layout| layout.granularity()))
}

fn fresh_tracker<C: StateConfig>(config: &C) -> Result<RangeTracker, StateError> {
    Ok(RangeTracker::new(
        config_granularity(config)?,
        config.order(),
        config.has_continuation(),
    ))
}

fn write_atomically(path: &Path, persisted: &PersistedState) -> Result<(), StateError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|error| StateError::io(parent, error))?;

    let temp = tempfile::Builder::new()
        .prefix(".collection-state")
        .tempfile_in(parent)
        .map_err(|error| StateError::io(parent, error))?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, persisted).map_err(StateError::Serialize)?;
        writer
            .flush()
            .map_err(|error| StateError::io(temp.path(), error))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|error| StateError::io(temp.path(), error))?;
    temp.persist(path)
        .map_err(|error| StateError::io(path, error.error))?;
    Ok(())
}
