//! Built-in observers.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Event, Observer, ObserverError};
use crate::pipeline::{Enrichment, Payload};

/// Writes every row as one JSON object per line.
///
/// Non-row events are ignored. Output is flushed after each row.
pub struct JsonLinesObserver<W> {
    writer: Mutex<W>,
}

#[derive(Serialize)]
struct RowLine<'a> {
    execution_id: Uuid,
    artifact: &'a str,
    payload: &'a Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Enrichment>,
}

impl<W: Write + Send> JsonLinesObserver<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the writer.
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<W: Write + Send> Observer for JsonLinesObserver<W> {
    fn name(&self) -> &str {
        "json_lines"
    }

    async fn notify(&self, event: &Event) -> Result<(), ObserverError> {
        let Event::Row {
            execution_id,
            artifact,
            row,
            ..
        } = event
        else {
            return Ok(());
        };

        let line = RowLine {
            execution_id: *execution_id,
            artifact,
            payload: &row.payload,
            metadata: row.metadata.as_ref(),
        };

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingObserver {
    _private: (),
}

impl LoggingObserver {
    /// Creates the observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Observer for LoggingObserver {
    fn name(&self) -> &str {
        "logging"
    }

    async fn notify(&self, event: &Event) -> Result<(), ObserverError> {
        match event {
            Event::Discovered { execution_id, info } => {
                debug!(%execution_id, artifact = %info.name, timestamp = ?info.timestamp, "artifact discovered");
            }
            Event::Downloaded {
                execution_id,
                artifact,
            } => {
                info!(
                    %execution_id,
                    artifact = %artifact.info.name,
                    path = %artifact.local_path.display(),
                    "artifact downloaded"
                );
            }
            Event::Row { .. } => {}
            Event::Error {
                execution_id,
                error,
            } => {
                warn!(%execution_id, artifact = ?error.artifact(), %error, "artifact failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::{ArtifactInfo, RowData};
    use crate::state::{CollectionState, LayoutConfig};

    fn row_event(row: RowData) -> Event {
        let state = CollectionState::new(LayoutConfig::untimed()).unwrap();
        Event::Row {
            execution_id: Uuid::nil(),
            artifact: "2024/01/a.log".into(),
            row,
            collection_state: Arc::new(state.snapshot()),
        }
    }

    #[tokio::test]
    async fn test_json_lines_writes_one_line_per_row() {
        let observer = JsonLinesObserver::new(Vec::new());
        observer
            .notify(&row_event(RowData::json(serde_json::json!({"status": 200}))))
            .await
            .unwrap();
        observer
            .notify(&row_event(
                RowData::text("raw").with_metadata(Enrichment::for_source("local_directory")),
            ))
            .await
            .unwrap();

        let output = String::from_utf8(observer.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["payload"]["status"], 200);
        assert_eq!(lines[0]["artifact"], "2024/01/a.log");
        assert!(lines[0].get("metadata").is_none());
        assert_eq!(lines[1]["payload"], "raw");
        assert_eq!(lines[1]["metadata"]["source_type"], "local_directory");
    }

    #[tokio::test]
    async fn test_json_lines_ignores_other_events() {
        let observer = JsonLinesObserver::new(Vec::new());
        observer
            .notify(&Event::Discovered {
                execution_id: Uuid::nil(),
                info: ArtifactInfo::new("a"),
            })
            .await
            .unwrap();
        assert!(observer.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_logging_observer_never_fails() {
        let observer = LoggingObserver::new();
        observer
            .notify(&row_event(RowData::text("x")))
            .await
            .unwrap();
    }
}
