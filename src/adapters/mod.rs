//! Device adapters and the registry that maps a device type to its adapter.
//!
//! An adapter turns one device family's `/status` payload into [`Sample`]s.
//! Adapters never return an error: a device that cannot be read yields a
//! single failure sample so the remaining devices keep polling.

pub mod shelly;

use crate::config::DeviceConfig;
use crate::error::{AppError, Result};
use crate::sample::Sample;
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use shelly::{PlugS, ThreeEm};

/// Deadline for one device request.
pub const TIMEOUT_RESPONSE_TIME: Duration = Duration::from_secs(20);

/// Upper bound for error descriptions written to the log.
pub const MAX_ERROR_DESCRIPTION_LEN: usize = 256;

/// Consecutive failed polls after which a device's failures are escalated
/// once and then logged quietly until it answers again.
pub const LOGGING_MAX_LEN_FAILURE: u32 = 5;

#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Non-empty, ordered samples for one poll of `device`.
    async fn fetch(&self, device: &DeviceConfig) -> Vec<Sample>;
}

/// Device-type identifier to adapter mapping.
///
/// Registering a type that is already present replaces the old adapter; the
/// replaced adapter is handed back to the caller and the replacement logged.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn DeviceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in Shelly adapters sharing one HTTP client.
    pub fn with_builtins(client: reqwest::Client) -> Self {
        let failures = Arc::new(FailureLog::new());
        let mut registry = Self::new();
        registry.register(
            shelly::PLUG_S,
            Arc::new(PlugS::new(client.clone(), failures.clone())),
        );
        registry.register(shelly::THREE_EM, Arc::new(ThreeEm::new(client, failures)));
        registry
    }

    pub fn register(
        &mut self,
        device_type: impl Into<String>,
        adapter: Arc<dyn DeviceAdapter>,
    ) -> Option<Arc<dyn DeviceAdapter>> {
        let device_type = device_type.into();
        let previous = self.adapters.insert(device_type.clone(), adapter);
        if previous.is_some() {
            warn!(device_type = %device_type, "adapter replaced for device type");
        } else {
            info!(device_type = %device_type, "adapter registered");
        }
        previous
    }

    pub fn contains(&self, device_type: &str) -> bool {
        self.adapters.contains_key(device_type)
    }

    pub fn device_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Poll `device` through the adapter registered for its type.
    pub async fn dispatch(&self, device: &DeviceConfig) -> Result<Vec<Sample>> {
        let adapter = self.adapters.get(&device.device_type).ok_or_else(|| {
            AppError::UnknownDeviceType {
                device: device.name.clone(),
                device_type: device.device_type.clone(),
            }
        })?;
        let samples = adapter.fetch(device).await;
        if samples.is_empty() {
            // a sample per poll is what downstream error rates count on
            return Ok(vec![Sample::failure(&device.name, now())]);
        }
        Ok(samples)
    }
}

/// Log severity for the n-th consecutive failure of the same thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Below [`LOGGING_MAX_LEN_FAILURE`]: log normally.
    Report,
    /// Exactly [`LOGGING_MAX_LEN_FAILURE`]: log once at error level.
    Escalate,
    /// Past the limit: debug only, until the streak ends.
    Quiet,
}

/// Consecutive-failure counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Streak {
    count: u32,
}

impl Streak {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn fail(&mut self) -> Escalation {
        self.count = self.count.saturating_add(1);
        match self.count {
            n if n < LOGGING_MAX_LEN_FAILURE => Escalation::Report,
            LOGGING_MAX_LEN_FAILURE => Escalation::Escalate,
            _ => Escalation::Quiet,
        }
    }

    /// End the streak; returns its length if there was one.
    pub fn recover(&mut self) -> Option<u32> {
        let ended = (self.count > 0).then_some(self.count);
        self.count = 0;
        ended
    }
}

/// Per-device streaks of failed polls, used to keep an unreachable device
/// from flooding the log.
#[derive(Debug, Default)]
pub struct FailureLog {
    streaks: Mutex<HashMap<String, Streak>>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log a failed poll and return the device's current streak.
    pub fn record_failure(&self, device: &str, description: &str) -> u32 {
        let (streak, escalation) = match self.streaks.lock() {
            Ok(mut streaks) => {
                let entry = streaks.entry(device.to_string()).or_default();
                let escalation = entry.fail();
                (entry.count(), escalation)
            }
            Err(_) => (1, Escalation::Report),
        };
        let description = truncate_description(description);
        match escalation {
            Escalation::Report => {
                warn!(device = %device, streak, error = %description, "failed to fetch device status")
            }
            Escalation::Escalate => error!(
                device = %device,
                streak,
                error = %description,
                "device keeps failing; further failures are logged at debug level"
            ),
            Escalation::Quiet => {
                debug!(device = %device, streak, error = %description, "failed to fetch device status")
            }
        }
        streak
    }

    pub fn record_success(&self, device: &str) {
        let ended = self
            .streaks
            .lock()
            .ok()
            .and_then(|mut streaks| streaks.remove(device))
            .and_then(|mut streak| streak.recover());
        if let Some(streak) = ended {
            info!(device = %device, failed_polls = streak, "device reachable again");
        }
    }

    pub fn streak(&self, device: &str) -> u32 {
        self.streaks
            .lock()
            .ok()
            .and_then(|streaks| streaks.get(device).map(Streak::count))
            .unwrap_or(0)
    }
}

/// HTTP client used by the built-in adapters.
pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(TIMEOUT_RESPONSE_TIME)
        .build()?)
}

/// Current UTC time at the store's timestamp precision.
pub fn now() -> DateTime<Utc> {
    let ts = Utc::now();
    ts.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(ts)
}

/// Error description cut to [`MAX_ERROR_DESCRIPTION_LEN`] characters.
pub fn truncate_description(description: &str) -> String {
    match description.char_indices().nth(MAX_ERROR_DESCRIPTION_LEN) {
        Some((idx, _)) => format!("{}...", &description[..idx]),
        None => description.to_string(),
    }
}
