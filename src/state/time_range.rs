//! Time ranges and the range tracker shared by both collection orders.
//!
//! A [`TimeRange`] records a span of collected time plus the identifiers seen
//! exactly on its boundaries. The [`RangeTracker`] owns the committed, sorted
//! and non-overlapping ranges and the provisional range of the current run.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::StateError;
use super::granularity::Granularity;

/// Direction in which a source walks through time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionOrder {
    /// Oldest artifacts first.
    #[default]
    Chronological,
    /// Newest artifacts first, walking back towards earlier runs.
    ReverseChronological,
}

/// A span of collected time.
///
/// `end_time` may precede `start_time` while a range is young: the end
/// boundary trails the newest observation by one granularity unit, so the
/// range has no fully closed interior until observations span more than that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    start_identifiers: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    end_identifiers: BTreeSet<String>,
    /// Every identifier observed, used only when granularity is zero.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    identifiers: BTreeSet<String>,
}

impl TimeRange {
    /// Creates a closed range `[start, end]` with empty boundary sets.
    #[must_use]
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start),
            end_time: Some(end),
            ..Self::default()
        }
    }

    /// Adds an identifier seen exactly at the start boundary.
    #[must_use]
    pub fn with_start_identifier(mut self, id: impl Into<String>) -> Self {
        self.start_identifiers.insert(id.into());
        self
    }

    /// Adds an identifier seen exactly at the end boundary.
    #[must_use]
    pub fn with_end_identifier(mut self, id: impl Into<String>) -> Self {
        self.end_identifiers.insert(id.into());
        self
    }

    /// Start boundary, if any observation has been made.
    #[must_use]
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// End boundary (the watermark), if one has been established.
    #[must_use]
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Identifiers observed exactly at the start boundary.
    #[must_use]
    pub fn start_identifiers(&self) -> &BTreeSet<String> {
        &self.start_identifiers
    }

    /// Identifiers observed exactly at the end boundary.
    #[must_use]
    pub fn end_identifiers(&self) -> &BTreeSet<String> {
        &self.end_identifiers
    }

    /// Identifiers tracked without time windows (granularity zero).
    #[must_use]
    pub fn identifiers(&self) -> &BTreeSet<String> {
        &self.identifiers
    }

    /// Whether nothing has been observed in this range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start_time.is_none() && self.end_time.is_none() && self.identifiers.is_empty()
    }

    /// Latest instant covered by this range, counting an inverted end as the start.
    fn upper_bound(&self) -> Option<DateTime<Utc>> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(start.max(end)),
            (start, end) => start.or(end),
        }
    }

    /// Decision for a timed observation, or `None` if this range has no say.
    fn decide(&self, timestamp: DateTime<Utc>, id: &str, granularity: Granularity) -> Option<bool> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time)
            && start < timestamp
            && timestamp < end
        {
            return Some(false);
        }
        if self.start_time == Some(timestamp) {
            return Some(!self.start_identifiers.contains(id));
        }
        if self.end_time == Some(timestamp) {
            return Some(!self.end_identifiers.contains(id));
        }
        if let Some(end) = self.end_time
            && end < timestamp
            && timestamp <= end + granularity.as_delta()
        {
            return Some(!self.end_identifiers.contains(id));
        }
        None
    }

    fn observe(
        &mut self,
        timestamp: DateTime<Utc>,
        id: &str,
        granularity: Granularity,
        order: CollectionOrder,
    ) {
        match self.start_time {
            None => {
                self.start_time = Some(timestamp);
                self.start_identifiers = BTreeSet::from([id.to_string()]);
            }
            Some(start) if timestamp < start => {
                self.start_time = Some(timestamp);
                self.start_identifiers = BTreeSet::from([id.to_string()]);
                if order == CollectionOrder::Chronological && !granularity.is_zero() {
                    warn!(
                        %timestamp,
                        previous_start = %start,
                        id,
                        "observation precedes range start; resetting range end"
                    );
                    self.end_time = None;
                    self.end_identifiers.clear();
                }
            }
            Some(start) if timestamp == start => {
                self.start_identifiers.insert(id.to_string());
            }
            Some(_) => {}
        }

        if granularity.is_zero() {
            self.identifiers.insert(id.to_string());
            return;
        }

        if let Some(end) = self.end_time
            && timestamp < end
        {
            if order == CollectionOrder::Chronological {
                warn!(
                    %timestamp,
                    end_time = %end,
                    id,
                    "observation precedes collection end; granularity may be misconfigured or clocks skewed"
                );
            }
            return;
        }

        let candidate_end = timestamp - granularity.as_delta();
        if self.end_time.is_none_or(|end| candidate_end > end) {
            self.end_time = Some(candidate_end);
            self.end_identifiers.clear();
        }
        if self.end_time == Some(timestamp) {
            self.end_identifiers.insert(id.to_string());
        }
    }

    /// Folds `other` into `self`, keeping the outermost boundaries.
    fn absorb(&mut self, other: TimeRange) {
        merge_boundary(
            &mut self.start_time,
            &mut self.start_identifiers,
            other.start_time,
            other.start_identifiers,
            |candidate, current| candidate < current,
        );
        merge_boundary(
            &mut self.end_time,
            &mut self.end_identifiers,
            other.end_time,
            other.end_identifiers,
            |candidate, current| candidate > current,
        );
        self.identifiers.extend(other.identifiers);
    }
}

fn merge_boundary(
    time: &mut Option<DateTime<Utc>>,
    ids: &mut BTreeSet<String>,
    other_time: Option<DateTime<Utc>>,
    other_ids: BTreeSet<String>,
    replaces: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
) {
    let Some(candidate) = other_time else {
        return;
    };
    match *time {
        None => {
            *time = Some(candidate);
            *ids = other_ids;
        }
        Some(current) if replaces(candidate, current) => {
            *time = Some(candidate);
            *ids = other_ids;
        }
        Some(current) if candidate == current => ids.extend(other_ids),
        Some(_) => {}
    }
}

/// Provisional progress of the current run.
#[derive(Debug, Clone, Default)]
struct ActiveRun {
    range: TimeRange,
    /// Index of the committed range this run extends.
    merge_into: Option<usize>,
}

/// Tracks committed ranges plus the provisional range of the active run.
///
/// Used by chronological and reverse-chronological collection alike; only the
/// choice of merge candidate and the handling of early observations differ.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeTracker {
    granularity: Granularity,
    #[serde(default)]
    order: CollectionOrder,
    #[serde(default)]
    has_continuation: bool,
    #[serde(default)]
    ranges: Vec<TimeRange>,
    #[serde(skip)]
    active: Option<ActiveRun>,
}

impl RangeTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(granularity: Granularity, order: CollectionOrder, has_continuation: bool) -> Self {
        Self {
            granularity,
            order,
            has_continuation,
            ranges: Vec::new(),
            active: None,
        }
    }

    /// Creates a tracker from existing committed ranges.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidRanges`] if the ranges are unsorted or overlap.
    pub fn with_ranges(
        granularity: Granularity,
        order: CollectionOrder,
        has_continuation: bool,
        ranges: Vec<TimeRange>,
    ) -> Result<Self, StateError> {
        let tracker = Self {
            ranges,
            ..Self::new(granularity, order, has_continuation)
        };
        tracker.validate()?;
        Ok(tracker)
    }

    /// Checks that committed ranges are sorted and non-overlapping.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidRanges`] describing the first violation.
    pub fn validate(&self) -> Result<(), StateError> {
        for (index, pair) in self.ranges.windows(2).enumerate() {
            let (Some(upper), Some(next_start)) = (pair[0].upper_bound(), pair[1].start_time)
            else {
                return Err(StateError::InvalidRanges {
                    reason: format!("range {index} or {} has no timed boundary", index + 1),
                });
            };
            if upper >= next_start {
                return Err(StateError::InvalidRanges {
                    reason: format!(
                        "range {index} ends at {upper} which is not before range {} starting at {next_start}",
                        index + 1
                    ),
                });
            }
        }
        Ok(())
    }

    /// Granularity used for lateness windows.
    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Overrides the granularity, e.g. after the naming scheme changed.
    pub fn set_granularity(&mut self, granularity: Granularity) {
        self.granularity = granularity;
    }

    /// Collection order.
    #[must_use]
    pub fn order(&self) -> CollectionOrder {
        self.order
    }

    /// Whether runs continue where the previous run stopped.
    #[must_use]
    pub fn has_continuation(&self) -> bool {
        self.has_continuation
    }

    /// Sets the order and continuation flags.
    pub fn set_mode(&mut self, order: CollectionOrder, has_continuation: bool) {
        self.order = order;
        self.has_continuation = has_continuation;
    }

    /// Committed ranges, sorted by start time.
    #[must_use]
    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    /// Provisional range of the active run, if a run is active.
    #[must_use]
    pub fn provisional(&self) -> Option<&TimeRange> {
        self.active.as_ref().map(|active| &active.range)
    }

    /// Whether a run is active.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.active.is_some()
    }

    /// Whether anything has ever been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.iter().all(TimeRange::is_empty)
    }

    /// Decides whether an observation still needs collecting.
    ///
    /// Any range, committed or provisional, that already covers the
    /// observation vetoes it; a lateness window of one range never overrides
    /// the interior of another.
    #[must_use]
    pub fn should_collect(&self, timestamp: DateTime<Utc>, id: &str) -> bool {
        let provisional = self.active.as_ref().map(|active| &active.range);
        let mut all = self.ranges.iter().chain(provisional);

        if self.granularity.is_zero() {
            return !all.any(|range| range.identifiers.contains(id));
        }

        !all.any(|range| range.decide(timestamp, id, self.granularity) == Some(false))
    }

    /// Records a collected observation in the provisional range.
    ///
    /// Starts a run implicitly if none is active.
    pub fn on_collected(&mut self, timestamp: DateTime<Utc>, id: &str) {
        if self.active.is_none() {
            debug!("recording observation outside a run; starting collection");
            self.start_collection();
        }
        let (granularity, order) = (self.granularity, self.order);
        if let Some(active) = self.active.as_mut() {
            active.range.observe(timestamp, id, granularity, order);
        }
    }

    /// Opens a provisional range for a new run and picks its merge candidate.
    ///
    /// - chronological with continuation: extends the latest range
    /// - chronological without continuation: extends the earliest range
    /// - reverse chronological: new range, merged into the latest range
    pub fn start_collection(&mut self) {
        if let Some(active) = &self.active
            && !active.range.is_empty()
        {
            warn!("collection restarted; discarding previous provisional range");
        }

        let merge_into = match (self.order, self.has_continuation) {
            (CollectionOrder::Chronological, false) => {
                if self.ranges.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            (CollectionOrder::Chronological, true) | (CollectionOrder::ReverseChronological, _) => {
                self.ranges.len().checked_sub(1)
            }
        };

        debug!(
            order = ?self.order,
            has_continuation = self.has_continuation,
            committed_ranges = self.ranges.len(),
            ?merge_into,
            "starting collection"
        );
        self.active = Some(ActiveRun {
            range: TimeRange::default(),
            merge_into,
        });
    }

    /// Commits the provisional range after a fully successful run.
    ///
    /// Returns `true` if committed ranges changed.
    pub fn end_collection(&mut self) -> bool {
        let Some(ActiveRun { range, merge_into }) = self.active.take() else {
            debug!("end_collection without an active run");
            return false;
        };
        if range.is_empty() {
            debug!("run produced no new extent; ranges unchanged");
            return false;
        }

        match merge_into {
            Some(index) if index < self.ranges.len() => self.ranges[index].absorb(range),
            _ => self.ranges.push(range),
        }
        self.ranges
            .sort_by_key(|range| range.start_time.or(range.end_time));
        self.coalesce();

        debug!(committed_ranges = self.ranges.len(), "collection committed");
        true
    }

    /// Drops the provisional range of a failed or interrupted run.
    pub fn abandon_collection(&mut self) {
        if let Some(active) = self.active.take()
            && !active.range.is_empty()
        {
            debug!("abandoning provisional range");
        }
    }

    /// Forgets committed progress from `from` onwards, or entirely for `None`.
    ///
    /// Ranges starting at or after `from` are dropped; a range spanning `from`
    /// is cut so its end boundary sits at `from` with no identifiers.
    pub fn reset(&mut self, from: Option<DateTime<Utc>>) {
        self.active = None;
        let Some(from) = from else {
            self.ranges.clear();
            return;
        };

        self.ranges
            .retain(|range| range.start_time.is_some_and(|start| start < from));
        for range in &mut self.ranges {
            if range.end_time.is_some_and(|end| end >= from) {
                range.end_time = Some(from);
                range.end_identifiers.clear();
            }
        }
    }

    /// Merges adjacent committed ranges that now touch or overlap.
    fn coalesce(&mut self) {
        let mut merged: Vec<TimeRange> = Vec::with_capacity(self.ranges.len());
        for range in std::mem::take(&mut self.ranges) {
            match merged.last_mut() {
                Some(previous)
                    if previous
                        .upper_bound()
                        .zip(range.start_time)
                        .is_some_and(|(upper, start)| upper >= start) =>
                {
                    previous.absorb(range);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }
}
