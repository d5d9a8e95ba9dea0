//! Named constructors for sources.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::error::SourceError;
use super::source::Source;

/// Builds a source from its JSON configuration.
pub type SourceFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Source>, SourceError> + Send + Sync>;

/// Explicit table of source constructors keyed by source type.
///
/// Sources are registered by the caller. Nothing registers itself.
#[derive(Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor, replacing any previous one for `source_type`.
    pub fn register(&mut self, source_type: impl Into<String>, factory: SourceFactory) {
        let source_type = source_type.into();
        debug!(source_type = %source_type, "registering source type");
        self.factories.insert(source_type, factory);
    }

    /// Whether a constructor exists for `source_type`.
    #[must_use]
    pub fn contains(&self, source_type: &str) -> bool {
        self.factories.contains_key(source_type)
    }

    /// Registered source types, sorted.
    pub fn source_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds a source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownSource`] for unregistered types, or the
    /// constructor's own error.
    pub fn build(
        &self,
        source_type: &str,
        config: &serde_json::Value,
    ) -> Result<Arc<dyn Source>, SourceError> {
        let factory = self
            .factories
            .get(source_type)
            .ok_or_else(|| SourceError::UnknownSource {
                name: source_type.to_string(),
                registered: self.source_types().collect::<Vec<_>>().join(", "),
            })?;
        factory(config)
    }
}
