use crate::error::{AppError, Result};
use crate::sample::{Sample, MEASUREMENT};
use crate::store::{SampleQuery, TimeSeriesStore};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// In-memory store. Reference implementation of [`TimeSeriesStore`], mainly
/// for tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(err: std::sync::PoisonError<T>) -> AppError {
    AppError::Other(anyhow::anyhow!("memory store mutex poisoned: {err}"))
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write(&self, samples: &[Sample]) -> Result<()> {
        let mut stored = self.samples.lock().map_err(poisoned)?;
        stored.extend_from_slice(samples);
        Ok(())
    }

    async fn query(&self, query: &SampleQuery) -> Result<Vec<Sample>> {
        if query.measurement != MEASUREMENT {
            return Ok(Vec::new());
        }
        let stored = self.samples.lock().map_err(poisoned)?;
        let mut found: Vec<Sample> = stored
            .iter()
            .filter(|s| s.device == query.device && query.range.contains(s.ts))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.ts);
        Ok(found)
    }
}
