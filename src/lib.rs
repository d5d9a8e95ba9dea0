//! Collector Core Library
//!
//! This library provides the core of an incremental artifact collector:
//! it discovers artifacts (log files, exports, archives) at a source,
//! downloads the ones not collected yet, turns them into rows and hands
//! every row to registered observers, remembering progress between runs.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`state`] - Collection state: time-range watermarks and persistence
//! - [`pipeline`] - Sources, loaders, mappers and the [`Collector`] orchestrator
//! - [`limiter`] - Rate and concurrency limiting for downloads
//! - [`events`] - Event bus and built-in observers
//! - [`sources`] - Built-in sources
//! - [`config`] - Pipeline configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod pipeline;
pub mod sources;
pub mod state;

// Re-export commonly used types
pub use config::{ConfigError, PipelineConfig, RateLimitConfig};
pub use error::ErrorList;
pub use events::{Event, EventBus, NotifyError, Observer, ObserverError};
pub use limiter::{LimiterError, LimiterPermit, RateLimiter};
pub use pipeline::{
    ArtifactInfo, CollectSummary, Collector, DownloadedArtifact, Loader, Mapper, PipelineError,
    RowData, Source, SourceError, SourceRegistry,
};
pub use state::{CollectionState, StateConfig, StateError, WatermarkDelta};
