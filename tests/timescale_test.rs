use census_collector::config::Credentials;
use census_collector::store::{SampleQuery, TimeRange, TimescaleGateway};
use census_collector::{AppError, FieldValue, Sample, TimeSeriesStore};
use chrono::{Duration, DurationRound, TimeDelta, Utc};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

/// Operations on an unverified gateway fail fast
#[tokio::test]
async fn test_unverified_gateway_rejects_operations() {
    let gateway = TimescaleGateway::unconfigured();
    let range = TimeRange::new(Utc::now() - Duration::hours(1), Utc::now());

    let err = gateway
        .query(&SampleQuery::census("fridge", range))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StoreUnverified));
}

/// Writing then reading a window returns identical samples
#[tokio::test]
#[ignore] // Requires database connection
async fn test_round_trip_against_database() {
    let creds = Credentials::from_env().expect("DB_* environment variables");
    let gateway = TimescaleGateway::new(&creds);
    assert!(gateway.verify().await);

    let device = format!("round-trip-{}", std::process::id());
    let end = Utc::now().duration_trunc(TimeDelta::seconds(1)).unwrap();

    let mut fields = BTreeMap::new();
    fields.insert("power".to_string(), FieldValue::F64(300.0));
    fields.insert("energy_wh".to_string(), FieldValue::F64(2.5));
    fields.insert("is_valid".to_string(), FieldValue::Bool(true));
    fields.insert("device_temperature".to_string(), FieldValue::F64(40.25));

    let written = vec![
        Sample::success(&device, end - Duration::minutes(3), fields.clone()),
        Sample::failure(&device, end - Duration::minutes(2)),
        Sample::success(&device, end - Duration::minutes(1), fields),
    ];
    gateway.write(&written).await.unwrap();

    let range = TimeRange::new(end - Duration::minutes(10), end);
    let read = gateway
        .query(&SampleQuery::census(&device, range))
        .await
        .unwrap();

    assert_eq!(read, written);
}

/// A wrong database name leaves the gateway unverified
#[tokio::test]
#[ignore] // Requires database connection
async fn test_verify_rejects_wrong_database() {
    let mut creds = Credentials::from_env().expect("DB_* environment variables");
    creds.database = format!("{}_missing", creds.database);
    let gateway = TimescaleGateway::new(&creds);

    assert!(!gateway.verify().await);
    assert!(!gateway.is_verified());
}
