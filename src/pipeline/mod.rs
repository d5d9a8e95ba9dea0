//! Collection pipeline: sources, loaders, mappers and the orchestrating
//! [`Collector`].
//!
//! # Architecture
//!
//! - [`Source`] - Async trait that discovers and downloads artifacts
//! - [`Loader`] - Turns a downloaded artifact into raw rows
//! - [`Mapper`] / [`MapperChain`] - Transforms rows in ordered stages
//! - [`Collector`] - Drives a source through the pipeline under a
//!   [`RateLimiter`](crate::limiter::RateLimiter) and records progress in a
//!   [`CollectionState`](crate::state::CollectionState)
//! - [`SourceRegistry`] - Explicit table of named source constructors
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use collector_core::events::{EventBus, JsonLinesObserver};
//! use collector_core::pipeline::{Collector, ParseJsonMapper};
//! use collector_core::sources::{LocalDirectoryConfig, LocalDirectorySource};
//! use collector_core::state::CollectionState;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LocalDirectoryConfig::new("/var/log/app")
//!     .with_file_layout("{year}/{month}/{day}/{name}.log");
//! let state = Arc::new(CollectionState::init(config.clone(), "state/app.json")?);
//! let source = Arc::new(LocalDirectorySource::new(config)?);
//!
//! let bus = Arc::new(EventBus::new().with_observer(Arc::new(JsonLinesObserver::new(std::io::stdout()))));
//! let collector = Collector::builder(source, state)
//!     .mapper(Arc::new(ParseJsonMapper))
//!     .event_bus(bus)
//!     .build()?;
//!
//! let summary = collector.collect(CancellationToken::new()).await?;
//! println!("{} rows", summary.rows);
//! # Ok(())
//! # }
//! ```

mod artifact;
mod collector;
mod completion;
mod error;
mod loader;
mod mapper;
mod registry;
mod row;
mod sequencer;
mod source;

pub use artifact::{ArtifactInfo, DownloadedArtifact, Enrichment};
pub use collector::{CollectSummary, Collector, CollectorBuilder};
pub use completion::{CompletionCounter, CompletionGuard};
pub use error::{ExtractFailure, LoaderError, MapperError, PipelineError, SourceError};
pub use loader::{
    DEFAULT_QUEUE_CAPACITY, DocumentLoader, LineLoader, Loader, LoaderKey, LoaderResolver,
    RowReceiver, RowSender, row_queue,
};
pub use mapper::{ChainOutput, ExplodeArrayMapper, Mapper, MapperChain, ParseJsonMapper};
pub use registry::{SourceFactory, SourceRegistry};
pub use row::{Payload, RowData};
pub use sequencer::{CommitSequencer, CommitTicket};
pub use source::{ArtifactSink, DiscoveryContext, Source};
