//! Query windows and chart granularity.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors raised at the query boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("invalid time window: end {end} is before start {start}")]
    InvalidTimeWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("unknown granularity '{0}' (expected day, week, month or year)")]
    UnknownGranularity(String),
}

/// A half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window, rejecting `end < start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, QueryError> {
        if end < start {
            return Err(QueryError::InvalidTimeWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn len(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// The equal-length window immediately before this one.
    pub fn previous(&self) -> Self {
        Self {
            start: self.start - self.len(),
            end: self.start,
        }
    }
}

/// Chart granularity, chosen by the requested time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    #[default]
    Week,
    Month,
    Year,
}

impl Granularity {
    /// Width of one chart bucket.
    pub fn bucket_width(&self) -> Duration {
        match self {
            Granularity::Day => Duration::minutes(5),
            Granularity::Week => Duration::hours(1),
            Granularity::Month => Duration::hours(12),
            Granularity::Year => Duration::days(1),
        }
    }

    /// The preset window of this range ending at `end`.
    pub fn window_ending(&self, end: DateTime<Utc>) -> TimeWindow {
        let start = match self {
            Granularity::Day => end - Duration::days(1),
            Granularity::Week => end - Duration::days(7),
            Granularity::Month => end
                .checked_sub_months(Months::new(1))
                .unwrap_or(end - Duration::days(30)),
            Granularity::Year => end
                .checked_sub_months(Months::new(12))
                .unwrap_or(end - Duration::days(365)),
        };
        TimeWindow { start, end }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            other => Err(QueryError::UnknownGranularity(other.to_string())),
        }
    }
}
