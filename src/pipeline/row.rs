//! Rows flowing from loaders through the mapper chain to observers.

use serde::Serialize;

use super::artifact::Enrichment;

/// Row content at any stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// Undecoded bytes (non UTF-8 input).
    Bytes(Vec<u8>),
    /// Raw text, typically one line of a log file.
    Text(String),
    /// Structured JSON.
    Json(serde_json::Value),
}

impl Payload {
    /// Wraps bytes as text when they are valid UTF-8.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(error) => Self::Bytes(error.into_bytes()),
        }
    }

    /// Short name of the variant, for logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
        }
    }
}

/// A row plus its provenance metadata.
///
/// `metadata` left unset by the mapper chain defaults to the owning
/// artifact's enrichment when the row is emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowData {
    /// Row content.
    pub payload: Payload,
    /// Provenance metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Enrichment>,
}

impl RowData {
    /// Creates a row without metadata.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            metadata: None,
        }
    }

    /// Creates a text row.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Payload::Text(text.into()))
    }

    /// Creates a JSON row.
    #[must_use]
    pub fn json(value: serde_json::Value) -> Self {
        Self::new(Payload::Json(value))
    }

    /// Sets metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Enrichment) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Replaces the payload, keeping metadata.
    #[must_use]
    pub fn map_payload(self, payload: Payload) -> Self {
        Self {
            payload,
            metadata: self.metadata,
        }
    }
}
