pub mod memory;
pub mod timescale;

use crate::error::Result;
use crate::sample::{Sample, MEASUREMENT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use timescale::TimescaleGateway;

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Range query for one device's samples in a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleQuery {
    pub measurement: String,
    pub device: String,
    pub range: TimeRange,
}

impl SampleQuery {
    pub fn census(device: impl Into<String>, range: TimeRange) -> Self {
        Self {
            measurement: MEASUREMENT.to_string(),
            device: device.into(),
            range,
        }
    }
}

/// Access layer to the persistent measurement store.
///
/// Implementations hold no connection between calls; each operation acquires
/// what it needs and releases it before returning, on success and on error.
/// A failed call is never retried here.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync + 'static {
    /// Persist samples in the given order.
    async fn write(&self, samples: &[Sample]) -> Result<()>;

    /// Samples matching the query, ordered by timestamp.
    async fn query(&self, query: &SampleQuery) -> Result<Vec<Sample>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_time_range_is_half_open() {
        let end = Utc::now();
        let start = end - Duration::hours(1);
        let range = TimeRange::new(start, end);

        assert!(range.contains(start));
        assert!(range.contains(end - Duration::seconds(1)));
        assert!(!range.contains(end));
        assert!(!range.contains(start - Duration::seconds(1)));
    }
}
