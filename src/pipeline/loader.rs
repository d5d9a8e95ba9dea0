//! Loaders turn a downloaded artifact into a stream of raw rows.
//!
//! A loader pushes rows into a bounded [`RowSender`]. The consumer side
//! ([`RowReceiver`]) sees either rows, an explicit error, or the end of the
//! stream once every sender is dropped.
//!
//! When no loader is configured, [`LoaderResolver`] picks one from the
//! artifact's compression and the row-per-line setting, caching one
//! instance per combination.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use flate2::read::MultiGzDecoder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::artifact::DownloadedArtifact;
use super::error::LoaderError;
use super::row::{Payload, RowData};

/// Default bound of the row queue between a loader and the mapper chain.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

type RowMessage = Result<RowData, LoaderError>;

/// Producer half of a row queue.
#[derive(Debug, Clone)]
pub struct RowSender {
    tx: mpsc::Sender<RowMessage>,
}

/// Consumer half of a row queue.
#[derive(Debug)]
pub struct RowReceiver {
    rx: mpsc::Receiver<RowMessage>,
}

/// Creates a bounded row queue.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn row_queue(capacity: usize) -> (RowSender, RowReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (RowSender { tx }, RowReceiver { rx })
}

impl RowSender {
    /// Sends a row, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::QueueClosed`] if the consumer went away.
    pub async fn send(&self, row: RowData) -> Result<(), LoaderError> {
        self.tx
            .send(Ok(row))
            .await
            .map_err(|_| LoaderError::QueueClosed)
    }

    /// Sends a row from a blocking context.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::QueueClosed`] if the consumer went away.
    pub fn blocking_send(&self, row: RowData) -> Result<(), LoaderError> {
        self.tx
            .blocking_send(Ok(row))
            .map_err(|_| LoaderError::QueueClosed)
    }

    /// Signals that loading failed. Returns `false` if nobody is listening.
    pub async fn fail(&self, error: LoaderError) -> bool {
        self.tx.send(Err(error)).await.is_ok()
    }
}

impl RowReceiver {
    /// Next row or error. `None` once all senders are dropped.
    pub async fn recv(&mut self) -> Option<Result<RowData, LoaderError>> {
        self.rx.recv().await
    }
}

/// Turns one downloaded artifact into raw rows.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loader name for logs.
    fn name(&self) -> &str;

    /// Streams the artifact's rows into `rows`.
    ///
    /// Returning an error ends the stream; the caller forwards it to the
    /// consumer.
    async fn load(
        &self,
        cancel: &CancellationToken,
        artifact: &DownloadedArtifact,
        rows: RowSender,
    ) -> Result<(), LoaderError>;
}

/// Emits one text row per non-blank line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineLoader {
    gzip: bool,
}

impl LineLoader {
    /// Loader for plain files.
    #[must_use]
    pub fn new() -> Self {
        Self { gzip: false }
    }

    /// Loader for gzip-compressed files.
    #[must_use]
    pub fn gzip() -> Self {
        Self { gzip: true }
    }
}

#[async_trait]
impl Loader for LineLoader {
    fn name(&self) -> &str {
        if self.gzip { "gzip_lines" } else { "lines" }
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        artifact: &DownloadedArtifact,
        rows: RowSender,
    ) -> Result<(), LoaderError> {
        let path = artifact.local_path.clone();
        let gzip = self.gzip;
        let cancel = cancel.clone();
        let count = tokio::task::spawn_blocking(move || read_lines(&path, gzip, &cancel, &rows))
            .await
            .map_err(|error| LoaderError::TaskFailed {
                message: error.to_string(),
            })??;
        debug!(artifact = %artifact.info.name, rows = count, loader = self.name(), "artifact loaded");
        Ok(())
    }
}

/// Emits the whole artifact as a single row.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentLoader {
    gzip: bool,
}

impl DocumentLoader {
    /// Loader for plain files.
    #[must_use]
    pub fn new() -> Self {
        Self { gzip: false }
    }

    /// Loader for gzip-compressed files.
    #[must_use]
    pub fn gzip() -> Self {
        Self { gzip: true }
    }
}

#[async_trait]
impl Loader for DocumentLoader {
    fn name(&self) -> &str {
        if self.gzip { "gzip_document" } else { "document" }
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        artifact: &DownloadedArtifact,
        rows: RowSender,
    ) -> Result<(), LoaderError> {
        if cancel.is_cancelled() {
            return Err(LoaderError::Cancelled);
        }
        let path = artifact.local_path.clone();
        let gzip = self.gzip;
        let bytes = tokio::task::spawn_blocking(move || read_all(&path, gzip))
            .await
            .map_err(|error| LoaderError::TaskFailed {
                message: error.to_string(),
            })??;
        if bytes.is_empty() {
            debug!(artifact = %artifact.info.name, "empty document skipped");
            return Ok(());
        }
        rows.send(RowData::new(Payload::from_bytes(bytes))).await
    }
}

fn open_reader(path: &Path, gzip: bool) -> Result<Box<dyn BufRead + Send>, LoaderError> {
    let file = File::open(path).map_err(|error| LoaderError::io(path, error))?;
    if gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn read_lines(
    path: &Path,
    gzip: bool,
    cancel: &CancellationToken,
    rows: &RowSender,
) -> Result<usize, LoaderError> {
    let reader = open_reader(path, gzip)?;
    let mut count = 0;
    for line in reader.split(b'\n') {
        if cancel.is_cancelled() {
            return Err(LoaderError::Cancelled);
        }
        let mut line = line.map_err(|error| LoaderError::io(path, error))?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        rows.blocking_send(RowData::new(Payload::from_bytes(line)))?;
        count += 1;
    }
    Ok(count)
}

fn read_all(path: &Path, gzip: bool) -> Result<Vec<u8>, LoaderError> {
    let mut reader = open_reader(path, gzip)?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|error| LoaderError::io(path, error))?;
    Ok(bytes)
}

/// Cache key for inferred loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoaderKey {
    /// Artifact is gzip-compressed.
    pub gzip: bool,
    /// Each line is a row.
    pub row_per_line: bool,
}

impl LoaderKey {
    fn build(self) -> Arc<dyn Loader> {
        match (self.row_per_line, self.gzip) {
            (true, false) => Arc::new(LineLoader::new()),
            (true, true) => Arc::new(LineLoader::gzip()),
            (false, false) => Arc::new(DocumentLoader::new()),
            (false, true) => Arc::new(DocumentLoader::gzip()),
        }
    }
}

/// Chooses the loader for each downloaded artifact.
pub struct LoaderResolver {
    explicit: Option<Arc<dyn Loader>>,
    row_per_line: bool,
    cache: DashMap<LoaderKey, Arc<dyn Loader>>,
}

impl std::fmt::Debug for LoaderResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderResolver")
            .field("explicit", &self.explicit.as_ref().map(|loader| loader.name()))
            .field("row_per_line", &self.row_per_line)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl LoaderResolver {
    /// Infers loaders from each artifact.
    #[must_use]
    pub fn inferred(row_per_line: bool) -> Self {
        Self {
            explicit: None,
            row_per_line,
            cache: DashMap::new(),
        }
    }

    /// Always uses `loader`.
    #[must_use]
    pub fn explicit(loader: Arc<dyn Loader>) -> Self {
        Self {
            explicit: Some(loader),
            row_per_line: true,
            cache: DashMap::new(),
        }
    }

    /// Number of inferred loaders built so far.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Loader for `artifact`.
    ///
    /// Concurrent callers with the same key share one instance.
    #[must_use]
    pub fn resolve(&self, artifact: &DownloadedArtifact) -> Arc<dyn Loader> {
        if let Some(loader) = &self.explicit {
            return Arc::clone(loader);
        }

        let key = LoaderKey {
            gzip: artifact.is_gzip(),
            row_per_line: self.row_per_line,
        };
        if let Some(loader) = self.cache.get(&key) {
            return Arc::clone(loader.value());
        }

        let loader = Arc::clone(self.cache.entry(key).or_insert_with(|| key.build()).value());
        debug!(?key, loader = loader.name(), "loader selected");
        loader
    }
}
