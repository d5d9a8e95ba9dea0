//! Collection state: the watermark store deciding what has been collected.
//!
//! A [`CollectionState`] answers two questions for a stream of
//! `(timestamp, identifier)` observations:
//!
//! - [`CollectionState::should_collect`]: has this item already been collected?
//! - [`CollectionState::on_collected`]: record that this item was collected.
//!
//! Progress is tracked as an ordered list of non-overlapping [`TimeRange`]s
//! managed by a [`RangeTracker`]. The tracker tolerates late arrivals up to
//! one [`Granularity`] unit, which is derived from the time fields of a
//! [`FileLayout`] template.
//!
//! # Run bracketing
//!
//! Observations made during a run go into a provisional range. Only
//! [`CollectionState::end_collection`], called after a fully successful run,
//! merges that range into the committed ones. A failed or interrupted run
//! leaves the committed ranges untouched.
//!
//! # Example
//!
//! ```no_run
//! use collector_core::state::{CollectionState, LayoutConfig};
//! use chrono::{TimeZone, Utc};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LayoutConfig::new("{year}/{month}/{day}/{hour}/{name}.log");
//! let state = CollectionState::init(config, "state/access_log/default.json")?;
//!
//! state.start_collection();
//! let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
//! if state.should_collect(ts, "app-1.log") {
//!     // ... collect
//!     state.on_collected(ts, "app-1.log");
//! }
//! state.end_collection();
//! state.save()?;
//! # Ok(())
//! # }
//! ```

mod collection_state;
mod error;
mod granularity;
mod lock;
mod template;
mod time_range;

pub use collection_state::{
    CollectionState, LayoutConfig, Observation, StateConfig, StateSnapshot, WatermarkDelta,
};
pub use error::StateError;
pub use granularity::{Granularity, TimeField};
pub use template::{FileLayout, LayoutMatch};
pub use time_range::{CollectionOrder, RangeTracker, TimeRange};
