//! Debounced on/off detection from observed energy per evaluation period.

use crate::config::AlarmConfig;
use crate::error::Result;
use crate::notify::{Notification, Notifier};
use crate::sample::Sample;
use crate::store::{SampleQuery, TimeRange, TimeSeriesStore};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    Off,
    On,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerState::Off => "off",
            PowerState::On => "on",
        })
    }
}

/// Outcome of one evaluation period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// No successful sample in the period.
    Failed,
    /// Energy drawn over the period, in Wh.
    Energy(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEvent {
    pub device: String,
    /// State the device switched to.
    pub state: PowerState,
    pub observed_wh: f64,
    pub threshold_wh: f64,
    pub ts: DateTime<Utc>,
}

impl fmt::Display for AlarmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} turned {} ({:.1} Wh observed, threshold {:.1} Wh)",
            self.device, self.state, self.observed_wh, self.threshold_wh
        )
    }
}

/// Per-device state with one consecutive-observation counter per direction.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerStateMachine {
    device: String,
    threshold_wh: f64,
    on_threshold: u32,
    off_threshold: u32,
    state: PowerState,
    on_counter: u32,
    off_counter: u32,
    last_observed: Option<DateTime<Utc>>,
}

impl PowerStateMachine {
    pub fn new(device: impl Into<String>, config: &AlarmConfig) -> Self {
        Self {
            device: device.into(),
            threshold_wh: config.threshold(),
            on_threshold: config.on_threshold.max(1),
            off_threshold: config.off_threshold.max(1),
            state: PowerState::Off,
            on_counter: 0,
            off_counter: 0,
            last_observed: None,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn counters(&self) -> (u32, u32) {
        (self.on_counter, self.off_counter)
    }

    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.last_observed
    }

    /// Feed one period's observation; returns an event on a state change.
    /// A failed observation leaves both counters untouched.
    pub fn observe(&mut self, ts: DateTime<Utc>, observation: Observation) -> Option<AlarmEvent> {
        let Observation::Energy(observed_wh) = observation else {
            return None;
        };
        self.last_observed = Some(ts);

        if observed_wh >= self.threshold_wh {
            self.off_counter = 0;
            self.on_counter = self.on_counter.saturating_add(1);
            if self.on_counter >= self.on_threshold && self.state == PowerState::Off {
                self.on_counter = 0;
                return Some(self.transition(PowerState::On, observed_wh, ts));
            }
        } else {
            self.on_counter = 0;
            self.off_counter = self.off_counter.saturating_add(1);
            if self.off_counter >= self.off_threshold && self.state == PowerState::On {
                self.off_counter = 0;
                return Some(self.transition(PowerState::Off, observed_wh, ts));
            }
        }
        None
    }

    fn transition(&mut self, state: PowerState, observed_wh: f64, ts: DateTime<Utc>) -> AlarmEvent {
        self.state = state;
        AlarmEvent {
            device: self.device.clone(),
            state,
            observed_wh,
            threshold_wh: self.threshold_wh,
            ts,
        }
    }
}

/// Energy drawn over a period of `period_secs` from its stored samples.
///
/// Polls that failed or never arrived are filled in with the mean energy of
/// the successful ones, so lost polls do not read as lower consumption. A
/// period without any successful sample is [`Observation::Failed`].
pub fn observe_samples(samples: &[Sample], period_secs: u64, interval_secs: u64) -> Observation {
    let energies: Vec<f64> = samples.iter().filter_map(Sample::energy_wh).collect();
    if energies.is_empty() {
        return Observation::Failed;
    }
    let observed: f64 = energies.iter().sum();
    let received = energies.len() as f64;
    let expected = if interval_secs == 0 {
        0.0
    } else {
        period_secs as f64 / interval_secs as f64
    };
    if received >= expected {
        return Observation::Energy(observed);
    }
    Observation::Energy(observed * expected / received)
}

/// Alarm evaluation for one device. Owns the device's state machine; nothing
/// else mutates it.
pub struct AlarmDetector {
    machine: PowerStateMachine,
    period: Duration,
    interval_secs: u64,
}

impl AlarmDetector {
    /// `interval_secs` is the device's sampling interval.
    pub fn new(device: impl Into<String>, config: &AlarmConfig, interval_secs: u64) -> Self {
        Self {
            machine: PowerStateMachine::new(device, config),
            period: Duration::minutes(config.period_min.max(1) as i64),
            interval_secs,
        }
    }

    pub fn machine(&self) -> &PowerStateMachine {
        &self.machine
    }

    /// Evaluate the period `[end - period, end)` and notify on a transition.
    pub async fn evaluate(
        &mut self,
        store: &dyn TimeSeriesStore,
        notifier: &dyn Notifier,
        end: DateTime<Utc>,
    ) -> Result<Option<AlarmEvent>> {
        let range = TimeRange::new(end - self.period, end);
        let samples = store
            .query(&SampleQuery::census(self.machine.device.as_str(), range))
            .await?;
        let period_secs = self.period.num_seconds().max(0) as u64;
        let observation = observe_samples(&samples, period_secs, self.interval_secs);
        debug!(device = %self.machine.device, ?observation, "alarm period evaluated");

        let Some(event) = self.machine.observe(end, observation) else {
            return Ok(None);
        };
        notifier.notify(Notification::Alarm(event.clone())).await?;
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::FieldValue;
    use std::collections::BTreeMap;

    fn config() -> AlarmConfig {
        AlarmConfig {
            reference_wh: 100.0,
            threshold_wh: Some(120.0),
            period_min: 30,
            on_threshold: 2,
            off_threshold: 1,
        }
    }

    #[test]
    fn test_on_then_off() {
        let mut machine = PowerStateMachine::new("fridge", &config());
        let t = Utc::now();

        assert_eq!(machine.observe(t, Observation::Energy(130.0)), None);
        assert_eq!(machine.counters(), (1, 0));

        let on = machine.observe(t, Observation::Energy(130.0)).unwrap();
        assert_eq!(on.state, PowerState::On);
        assert_eq!(machine.state(), PowerState::On);
        assert_eq!(machine.counters(), (0, 0));

        let off = machine.observe(t, Observation::Energy(90.0)).unwrap();
        assert_eq!(off.state, PowerState::Off);
        assert_eq!(off.observed_wh, 90.0);
        assert_eq!(off.threshold_wh, 120.0);
        assert_eq!(machine.state(), PowerState::Off);
    }

    #[test]
    fn test_single_spike_does_not_turn_on() {
        let mut machine = PowerStateMachine::new("fridge", &config());
        let t = Utc::now();
        assert!(machine.observe(t, Observation::Energy(500.0)).is_none());
        assert!(machine.observe(t, Observation::Energy(10.0)).is_none());
        assert!(machine.observe(t, Observation::Energy(500.0)).is_none());
        assert_eq!(machine.state(), PowerState::Off);
    }

    #[test]
    fn test_failed_observation_is_ignored() {
        let mut machine = PowerStateMachine::new("fridge", &config());
        let t = Utc::now();

        machine.observe(t, Observation::Energy(130.0));
        assert!(machine.observe(t, Observation::Failed).is_none());
        assert_eq!(machine.counters(), (1, 0));
        assert_eq!(machine.last_observed(), Some(t));

        // the failure neither reset nor advanced the on counter
        assert!(machine.observe(t, Observation::Energy(130.0)).is_some());
        assert_eq!(machine.state(), PowerState::On);

        assert!(machine.observe(t, Observation::Failed).is_none());
        assert_eq!(machine.state(), PowerState::On);
    }

    #[test]
    fn test_threshold_defaults_to_reference_factor() {
        let cfg = AlarmConfig {
            threshold_wh: None,
            ..config()
        };
        let mut machine = PowerStateMachine::new("fridge", &cfg);
        let t = Utc::now();
        // exactly at the threshold counts as above
        machine.observe(t, Observation::Energy(120.0));
        assert!(machine.observe(t, Observation::Energy(120.0)).is_some());
    }

    fn energy(ts: DateTime<Utc>, wh: f64) -> Sample {
        let mut fields = BTreeMap::new();
        fields.insert("energy_wh".to_string(), FieldValue::F64(wh));
        Sample::success("fridge", ts, fields)
    }

    #[test]
    fn test_observe_samples() {
        let t = Utc::now();

        assert_eq!(observe_samples(&[], 60, 30), Observation::Failed);
        assert_eq!(
            observe_samples(&[Sample::failure("fridge", t)], 60, 30),
            Observation::Failed
        );
        // both expected polls arrived
        assert_eq!(
            observe_samples(&[energy(t, 2.5), energy(t, 2.5)], 60, 30),
            Observation::Energy(5.0)
        );
        // one of two expected polls failed; the other stands in for it
        assert_eq!(
            observe_samples(&[energy(t, 2.5), Sample::failure("fridge", t)], 60, 30),
            Observation::Energy(5.0)
        );
        // surplus samples are summed as they are
        assert_eq!(
            observe_samples(&[energy(t, 2.5), energy(t, 2.5), energy(t, 2.5)], 60, 30),
            Observation::Energy(7.5)
        );
    }

    /// 300 W every 30 s is 150 Wh per 30 min; losing a quarter of the polls
    /// in a period must not switch the device off.
    #[tokio::test]
    async fn test_lost_polls_do_not_turn_device_off() {
        use crate::notify::ChannelNotifier;
        use crate::store::MemoryStore;
        use chrono::TimeZone;

        let store = MemoryStore::new();
        let (notifier, _rx) = ChannelNotifier::channel(8);
        let mut detector = AlarmDetector::new("fridge", &config(), 30);

        let start = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let per_poll = crate::sample::energy_wh(300.0, 30);
        let mut samples = Vec::new();
        for period in 0..3i64 {
            for poll in 0..60i64 {
                let ts = start + Duration::minutes(30 * period) + Duration::seconds(30 * poll);
                if period == 2 && poll % 4 == 0 {
                    samples.push(Sample::failure("fridge", ts));
                } else {
                    samples.push(energy(ts, per_poll));
                }
            }
        }
        store.write(&samples).await.unwrap();

        let mut states = Vec::new();
        for period in 1..=3i64 {
            let end = start + Duration::minutes(30 * period);
            detector.evaluate(&store, &notifier, end).await.unwrap();
            states.push(detector.machine().state());
        }

        assert_eq!(states, vec![PowerState::Off, PowerState::On, PowerState::On]);
        assert_eq!(detector.machine().counters(), (1, 0));
    }
}
