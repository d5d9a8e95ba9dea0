//! Built-in sources.
//!
//! - [`LocalDirectorySource`] - Files below a local directory

mod local;

pub use local::{LocalDirectoryConfig, LocalDirectorySource};

use crate::pipeline::SourceRegistry;

/// Builds the registry of built-in source types used by the CLI.
#[must_use]
pub fn build_default_source_registry() -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    registry.register(
        LocalDirectorySource::SOURCE_TYPE,
        Box::new(LocalDirectorySource::from_value),
    );
    registry
}
