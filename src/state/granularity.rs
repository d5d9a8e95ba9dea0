//! Time resolution derivable from an artifact naming scheme.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Time fields that can be captured from an artifact name, largest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeField {
    /// Four digit year.
    Year,
    /// Two digit month.
    Month,
    /// Two digit day of month.
    Day,
    /// Two digit hour.
    Hour,
    /// Two digit minute.
    Minute,
    /// Two digit second.
    Second,
}

impl TimeField {
    /// All fields, largest to smallest.
    pub const ALL: [TimeField; 6] = [
        TimeField::Year,
        TimeField::Month,
        TimeField::Day,
        TimeField::Hour,
        TimeField::Minute,
        TimeField::Second,
    ];

    /// Placeholder name used in layout templates.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }

    /// Parses a placeholder name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.name() == name)
    }

    /// Resolution contributed when this is the finest field present.
    ///
    /// Months count as 30 days and years as 365 days.
    #[must_use]
    pub fn resolution(self) -> TimeDelta {
        match self {
            Self::Year => TimeDelta::days(365),
            Self::Month => TimeDelta::days(30),
            Self::Day => TimeDelta::days(1),
            Self::Hour => TimeDelta::hours(1),
            Self::Minute => TimeDelta::minutes(1),
            Self::Second => TimeDelta::seconds(1),
        }
    }
}

/// Minimum time resolution of a naming scheme, in whole seconds.
///
/// Doubles as the maximum tolerated lateness for out-of-order arrivals.
/// Zero means timing cannot be deduced from names, so every identifier is
/// tracked instead of time windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Granularity(i64);

impl Granularity {
    /// No derivable timing.
    pub const ZERO: Granularity = Granularity(0);

    /// Creates a granularity from a duration, truncated to whole seconds.
    #[must_use]
    pub fn from_delta(delta: TimeDelta) -> Self {
        Self(delta.num_seconds().max(0))
    }

    /// Derives the granularity from the set of time fields a template captures.
    ///
    /// Fields are walked largest to smallest and the walk stops at the first
    /// missing field, so `year` + `day` without `month` resolves to one year.
    #[must_use]
    pub fn from_fields(present: &[TimeField]) -> Self {
        let mut finest = None;
        for field in TimeField::ALL {
            if !present.contains(&field) {
                break;
            }
            finest = Some(field);
        }
        finest.map_or(Self::ZERO, |field| Self::from_delta(field.resolution()))
    }

    /// Whether timing is untracked.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Granularity in seconds.
    #[must_use]
    pub fn as_secs(self) -> i64 {
        self.0
    }

    /// Granularity as a duration.
    #[must_use]
    pub fn as_delta(self) -> TimeDelta {
        TimeDelta::seconds(self.0)
    }
}
