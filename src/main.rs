//! CLI entry point for the collector tool.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use collector_core::events::{EventBus, JsonLinesObserver, LoggingObserver};
use collector_core::pipeline::{Collector, ExplodeArrayMapper, ParseJsonMapper};
use collector_core::sources::{LocalDirectorySource, build_default_source_registry};
use collector_core::state::CollectionState;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // stdout carries rows, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let pipeline_config = args.pipeline_config()?;
    let source_config = args.source_config();

    let registry = build_default_source_registry();
    let source = registry.build(
        LocalDirectorySource::SOURCE_TYPE,
        &serde_json::to_value(&source_config)?,
    )?;

    let state = Arc::new(
        CollectionState::init(source_config, &args.state)
            .with_context(|| format!("failed to open state file {}", args.state.display()))?,
    );
    if args.reset {
        info!(state = %args.state.display(), "resetting collection state");
        state.reset(None);
    }

    let bus = EventBus::new()
        .with_observer(Arc::new(LoggingObserver::new()))
        .with_observer(Arc::new(JsonLinesObserver::new(io::stdout())));

    let mut builder = Collector::builder(source, Arc::clone(&state))
        .configure(&pipeline_config)?
        .event_bus(Arc::new(bus));
    if !args.raw {
        builder = builder.mapper(Arc::new(ParseJsonMapper));
    }
    if let Some(field) = &args.explode {
        builder = builder.mapper(Arc::new(ExplodeArrayMapper::new(field)));
    }
    let collector = builder.build()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight artifacts");
                cancel.cancel();
            }
        });
    }

    let summary = collector.collect(cancel).await?;

    info!(
        discovered = summary.discovered,
        skipped = summary.skipped,
        downloaded = summary.downloaded,
        failed = summary.failed,
        rows = summary.rows,
        "Collection complete"
    );

    Ok(())
}
