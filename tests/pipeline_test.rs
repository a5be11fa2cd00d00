use async_trait::async_trait;
use census_collector::adapters::{AdapterRegistry, DeviceAdapter};
use census_collector::alarm::{AlarmDetector, PowerState};
use census_collector::config::{AlarmConfig, DeviceConfig};
use census_collector::cost::{run_cost_report, WindowKind};
use census_collector::notify::{ChannelNotifier, Notification};
use census_collector::scheduler::poll_once;
use census_collector::store::{SampleQuery, TimeRange};
use census_collector::{FieldValue, MemoryStore, Sample, TimeSeriesStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;

fn energy_sample(device: &str, ts: DateTime<Utc>, energy_wh: f64) -> Sample {
    let mut fields = BTreeMap::new();
    fields.insert("power".to_string(), FieldValue::F64(energy_wh * 120.0));
    fields.insert("energy_wh".to_string(), FieldValue::F64(energy_wh));
    fields.insert("is_valid".to_string(), FieldValue::Bool(true));
    Sample::success(device, ts, fields)
}

struct FixedPower(f64);

#[async_trait]
impl DeviceAdapter for FixedPower {
    async fn fetch(&self, device: &DeviceConfig) -> Vec<Sample> {
        let energy = census_collector::sample::energy_wh(self.0, device.update_time);
        vec![energy_sample(&device.name, Utc::now(), energy)]
    }
}

/// Writing N samples and querying the same window returns them unchanged
#[tokio::test]
async fn test_store_round_trip() {
    let store = MemoryStore::new();
    let end = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let written: Vec<Sample> = (1..=10)
        .map(|i| {
            if i % 4 == 0 {
                Sample::failure("fridge", end - Duration::minutes(i))
            } else {
                energy_sample("fridge", end - Duration::minutes(i), i as f64)
            }
        })
        .collect();
    store.write(&written).await.unwrap();

    let range = TimeRange::new(end - Duration::hours(1), end);
    let read = store.query(&SampleQuery::census("fridge", range)).await.unwrap();

    let mut expected = written.clone();
    expected.sort_by_key(|s| s.ts);
    assert_eq!(read, expected);
}

/// Three 2.5 Wh samples over a day at 0.30 per kWh
#[tokio::test]
async fn test_daily_cost_report_scenario() {
    let store = MemoryStore::new();
    let now = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
    store
        .write(&[
            energy_sample("fridge", now - Duration::hours(20), 2.5),
            energy_sample("fridge", now - Duration::hours(10), 2.5),
            energy_sample("fridge", now - Duration::hours(1), 2.5),
            // outside the window
            energy_sample("fridge", now - Duration::hours(30), 2.5),
            energy_sample("fridge", now, 2.5),
        ])
        .await
        .unwrap();

    let (notifier, mut rx) = ChannelNotifier::channel(8);
    let report = run_cost_report(&store, &notifier, "fridge", 30, WindowKind::Day, now, 0.30)
        .await
        .unwrap()
        .unwrap();

    assert!((report.sum_energy_kwh - 0.0075).abs() < 1e-12);
    assert!((report.total_cost - 0.00225).abs() < 1e-12);
    assert_eq!(report.error_rate_one, 0.0);
    assert!(report.error_rate_two > 99.0);

    match rx.try_recv().unwrap() {
        Notification::CostReport(sent) => assert_eq!(sent, report),
        other => panic!("unexpected notification: {other:?}"),
    }
}

/// An empty window produces neither a report nor a notification
#[tokio::test]
async fn test_empty_window_is_silent() {
    let store = MemoryStore::new();
    let (notifier, mut rx) = ChannelNotifier::channel(8);

    for kind in WindowKind::ALL {
        let report = run_cost_report(&store, &notifier, "fridge", 30, kind, Utc::now(), 0.30)
            .await
            .unwrap();
        assert!(report.is_none());
    }
    assert!(rx.try_recv().is_err());
}

/// A device unreachable all day still gets a report from its failure samples
#[tokio::test]
async fn test_unreachable_day_reports_full_error_rate() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let failures: Vec<Sample> = (1..=48)
        .map(|i| Sample::failure("fridge", now - Duration::minutes(i * 30)))
        .collect();
    store.write(&failures).await.unwrap();

    let (notifier, _rx) = ChannelNotifier::channel(8);
    let report = run_cost_report(&store, &notifier, "fridge", 1800, WindowKind::Day, now, 0.30)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.error_rate_one, 100.0);
    assert_eq!(report.error_rate_two, 100.0);
    assert_eq!(report.total_cost, 0.0);
}

/// 130 Wh, 130 Wh, 90 Wh: OFF -> ON -> OFF
#[tokio::test]
async fn test_alarm_scenario_through_store() {
    let store = MemoryStore::new();
    let config = AlarmConfig {
        reference_wh: 100.0,
        threshold_wh: Some(120.0),
        period_min: 30,
        on_threshold: 2,
        off_threshold: 1,
    };
    // 15-minute polls: two per period
    let mut detector = AlarmDetector::new("fridge", &config, 900);
    let (notifier, mut rx) = ChannelNotifier::channel(8);

    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let period = Duration::minutes(30);
    let observed = [130.0, 130.0, 90.0];
    for (i, wh) in observed.iter().enumerate() {
        let period_start = start + period * i as i32;
        // two samples per period splitting the energy
        store
            .write(&[
                energy_sample("fridge", period_start + Duration::minutes(5), wh / 2.0),
                energy_sample("fridge", period_start + Duration::minutes(20), wh / 2.0),
            ])
            .await
            .unwrap();
    }

    let mut events = Vec::new();
    for i in 1..=observed.len() {
        let end = start + period * i as i32;
        events.push(detector.evaluate(&store, &notifier, end).await.unwrap());
    }

    assert!(events[0].is_none());
    assert_eq!(events[1].as_ref().map(|e| e.state), Some(PowerState::On));
    assert_eq!(events[2].as_ref().map(|e| e.state), Some(PowerState::Off));
    assert_eq!(detector.machine().state(), PowerState::Off);

    let mut delivered = Vec::new();
    while let Ok(Notification::Alarm(event)) = rx.try_recv() {
        delivered.push(event.state);
    }
    assert_eq!(delivered, vec![PowerState::On, PowerState::Off]);
}

/// A period with only failed samples does not count as an observation
#[tokio::test]
async fn test_alarm_ignores_failed_period() {
    let store = MemoryStore::new();
    let config = AlarmConfig {
        threshold_wh: Some(120.0),
        ..AlarmConfig::default()
    };
    let mut detector = AlarmDetector::new("fridge", &config, 1800);
    let (notifier, _rx) = ChannelNotifier::channel(8);

    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let period = Duration::minutes(30);
    store
        .write(&[
            energy_sample("fridge", start + Duration::minutes(10), 150.0),
            Sample::failure("fridge", start + Duration::minutes(40)),
            energy_sample("fridge", start + Duration::minutes(70), 150.0),
        ])
        .await
        .unwrap();

    assert!(detector.evaluate(&store, &notifier, start + period).await.unwrap().is_none());
    assert!(detector
        .evaluate(&store, &notifier, start + period * 2)
        .await
        .unwrap()
        .is_none());
    assert_eq!(detector.machine().counters(), (1, 0));

    let event = detector
        .evaluate(&store, &notifier, start + period * 3)
        .await
        .unwrap();
    assert_eq!(event.map(|e| e.state), Some(PowerState::On));
}

/// Polling writes the adapter's samples; an unknown type writes nothing
#[tokio::test]
async fn test_poll_once_persists_samples() {
    let store = MemoryStore::new();
    let mut registry = AdapterRegistry::new();
    registry.register("fake:plug", Arc::new(FixedPower(300.0)));

    let mut fridge = DeviceConfig {
        name: "fridge".into(),
        device_type: "fake:plug".into(),
        address: "unused".into(),
        update_time: 30,
        cost_calc_day: true,
        cost_month: None,
        cost_year: None,
        alarm: None,
    };
    tokio_test::assert_ok!(poll_once(&fridge, &registry, &store).await);
    tokio_test::assert_ok!(poll_once(&fridge, &registry, &store).await);
    assert_eq!(store.len(), 2);

    fridge.device_type = "acme:toaster".into();
    tokio_test::assert_err!(poll_once(&fridge, &registry, &store).await);
    assert_eq!(store.len(), 2);

    let range = TimeRange::new(Utc::now() - Duration::minutes(1), Utc::now() + Duration::minutes(1));
    let stored = store.query(&SampleQuery::census("fridge", range)).await.unwrap();
    assert!(stored.iter().all(|s| s.energy_wh() == Some(2.5)));
}
