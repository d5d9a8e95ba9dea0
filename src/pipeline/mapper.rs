//! Mappers transform rows; a [`MapperChain`] runs them in sequence.
//!
//! Each stage maps every row produced by the previous stage to zero, one or
//! many rows. A failing row is dropped from that stage and its error kept;
//! the remaining rows still flow through every stage. Errors are returned
//! together once the whole batch has been processed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::error::MapperError;
use super::row::{Payload, RowData};

/// Transforms one row into zero or more rows.
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Mapper name for logs and errors.
    fn name(&self) -> &str;

    /// Maps one row.
    async fn map(
        &self,
        cancel: &CancellationToken,
        row: RowData,
    ) -> Result<Vec<RowData>, MapperError>;
}

/// Rows and errors produced by running a batch through a [`MapperChain`].
#[derive(Debug, Default)]
pub struct ChainOutput {
    /// Rows that survived every stage.
    pub rows: Vec<RowData>,
    /// Every per-row failure, in stage then row order.
    pub errors: Vec<MapperError>,
}

/// Ordered list of mappers. An empty chain passes rows through unchanged.
#[derive(Clone, Default)]
pub struct MapperChain {
    stages: Vec<Arc<dyn Mapper>>,
}

impl std::fmt::Debug for MapperChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|stage| stage.name()))
            .finish()
    }
}

impl MapperChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn with(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.stages.push(mapper);
        self
    }

    /// Appends a stage.
    pub fn push(&mut self, mapper: Arc<dyn Mapper>) {
        self.stages.push(mapper);
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs `rows` through every stage.
    pub async fn apply(&self, cancel: &CancellationToken, rows: Vec<RowData>) -> ChainOutput {
        let mut current = rows;
        let mut errors = Vec::new();

        for stage in &self.stages {
            let mut next = Vec::with_capacity(current.len());
            for row in current {
                match stage.map(cancel, row).await {
                    Ok(mapped) => next.extend(mapped),
                    Err(error) => {
                        trace!(mapper = stage.name(), %error, "row dropped by mapper");
                        errors.push(error);
                    }
                }
            }
            current = next;
        }

        ChainOutput {
            rows: current,
            errors,
        }
    }
}

/// Parses text or byte payloads as JSON. JSON payloads pass through.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseJsonMapper;

impl ParseJsonMapper {
    const NAME: &'static str = "parse_json";
}

#[async_trait]
impl Mapper for ParseJsonMapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn map(
        &self,
        _cancel: &CancellationToken,
        row: RowData,
    ) -> Result<Vec<RowData>, MapperError> {
        let RowData { payload, metadata } = row;
        let parsed = match payload {
            Payload::Json(value) => Ok(value),
            Payload::Text(text) => serde_json::from_str(&text),
            Payload::Bytes(bytes) => serde_json::from_slice(&bytes),
        };
        let value = parsed.map_err(|source| MapperError::InvalidJson {
            mapper: Self::NAME.to_string(),
            source,
        })?;
        Ok(vec![RowData {
            payload: Payload::Json(value),
            metadata,
        }])
    }
}

/// Splits a JSON object into one row per element of an array field.
///
/// `{"records": [a, b]}` with field `records` becomes rows `a` and `b`, each
/// keeping the input row's metadata.
#[derive(Debug, Clone)]
pub struct ExplodeArrayMapper {
    field: String,
}

impl ExplodeArrayMapper {
    const NAME: &'static str = "explode_array";

    /// Explodes the array stored under `field`.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

#[async_trait]
impl Mapper for ExplodeArrayMapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn map(
        &self,
        _cancel: &CancellationToken,
        row: RowData,
    ) -> Result<Vec<RowData>, MapperError> {
        let RowData { payload, metadata } = row;
        let kind = payload.kind();
        let Payload::Json(mut value) = payload else {
            return Err(MapperError::UnsupportedPayload {
                mapper: Self::NAME.to_string(),
                kind,
            });
        };

        let Some(serde_json::Value::Array(items)) = value
            .as_object_mut()
            .and_then(|object| object.remove(&self.field))
        else {
            return Err(MapperError::MissingField {
                mapper: Self::NAME.to_string(),
                field: self.field.clone(),
            });
        };

        Ok(items
            .into_iter()
            .map(|item| RowData {
                payload: Payload::Json(item),
                metadata: metadata.clone(),
            })
            .collect())
    }
}
