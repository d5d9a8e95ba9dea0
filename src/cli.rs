//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use collector_core::config::{ConfigError, PipelineConfig, RateLimitConfig};
use collector_core::sources::LocalDirectoryConfig;
use collector_core::state::CollectionOrder;

/// Incrementally collect rows from artifacts in a local directory.
///
/// Rows are written to stdout as JSON lines. Progress is recorded in the
/// state file so the next run only collects new artifacts.
#[derive(Parser, Debug)]
#[command(name = "collector")]
#[command(author, version, about)]
pub struct Args {
    /// Directory to collect artifacts from
    #[arg(short = 'd', long)]
    pub dir: PathBuf,

    /// Layout of artifact paths, e.g. "{year}/{month}/{day}/{name}.log"
    #[arg(short = 'l', long)]
    pub layout: Option<String>,

    /// Collection state file
    #[arg(short = 's', long)]
    pub state: PathBuf,

    /// Pipeline configuration file (JSON); flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Maximum downloads started per second
    #[arg(long)]
    pub rate: Option<f64>,

    /// Downloads allowed back to back when --rate is set
    #[arg(long, requires = "rate", value_parser = clap::value_parser!(u32).range(1..))]
    pub burst: Option<u32>,

    /// Emit each artifact as a single row instead of one row per line
    #[arg(long)]
    pub document: bool,

    /// Emit rows as raw text without parsing them as JSON
    #[arg(long)]
    pub raw: bool,

    /// Split each JSON row into one row per element of this array field
    #[arg(long, value_name = "FIELD", conflicts_with = "raw")]
    pub explode: Option<String>,

    /// Collect newest artifacts first
    #[arg(long)]
    pub reverse: bool,

    /// Continue from where the previous run stopped
    #[arg(long)]
    pub continuation: bool,

    /// Forget recorded progress before collecting
    #[arg(long)]
    pub reset: bool,

    /// Source name recorded in row metadata (defaults to the directory name)
    #[arg(long)]
    pub source_name: Option<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Pipeline settings from the config file (if any) with flags applied on top.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_path(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(concurrency) = self.concurrency {
            config.max_concurrency = Some(usize::from(concurrency));
        }
        if let Some(per_second) = self.rate {
            config.rate_limit = Some(RateLimitConfig {
                per_second,
                burst: self.burst.unwrap_or(1),
            });
        }
        if self.document {
            config.row_per_line = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Source settings for the local directory.
    pub fn source_config(&self) -> LocalDirectoryConfig {
        let order = if self.reverse {
            CollectionOrder::ReverseChronological
        } else {
            CollectionOrder::Chronological
        };
        LocalDirectoryConfig {
            path: self.dir.clone(),
            file_layout: self.layout.clone(),
            source_name: self.source_name.clone(),
            order,
            has_continuation: self.continuation,
        }
    }
}
