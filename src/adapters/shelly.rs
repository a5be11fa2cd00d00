//! Shelly Plug S (single meter) and Shelly 3EM (three-phase) adapters.

use super::{now, DeviceAdapter, FailureLog};
use crate::config::DeviceConfig;
use crate::error::{AppError, Result};
use crate::sample::{energy_wh, FieldValue, Sample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const PLUG_S: &str = "shelly:plug-s";
pub const THREE_EM: &str = "shelly:3em";

const PHASES: [char; 3] = ['a', 'b', 'c'];

#[derive(Debug, Clone, Deserialize)]
pub struct PlugStatus {
    pub meters: Vec<Meter>,
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Meter {
    pub power: f64,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreeEmStatus {
    pub emeters: Vec<EMeter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EMeter {
    pub power: f64,
    pub pf: f64,
    pub current: f64,
    pub voltage: f64,
    pub is_valid: bool,
}

/// GET `http://{address}/status` and decode the body. Non-2xx is an error.
async fn get_status<T: DeserializeOwned>(client: &reqwest::Client, address: &str) -> Result<T> {
    let url = format!("http://{}/status", address);
    let body = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    Ok(serde_json::from_slice(&body)?)
}

fn into_samples(
    failures: &FailureLog,
    device: &DeviceConfig,
    ts: DateTime<Utc>,
    outcome: Result<Sample>,
) -> Vec<Sample> {
    match outcome {
        Ok(sample) => {
            failures.record_success(&device.name);
            vec![sample]
        }
        Err(e) => {
            failures.record_failure(&device.name, &e.to_string());
            vec![Sample::failure(&device.name, ts)]
        }
    }
}

/// Single-meter sample from a Plug S status document.
pub fn normalize_plug_s(
    device: &str,
    ts: DateTime<Utc>,
    interval_secs: u64,
    status: &PlugStatus,
) -> Result<Sample> {
    let meter = status
        .meters
        .first()
        .ok_or_else(|| AppError::Device(format!("{device}: status has no meters")))?;

    let mut fields = BTreeMap::new();
    fields.insert("power".to_string(), FieldValue::F64(meter.power));
    fields.insert("is_valid".to_string(), FieldValue::Bool(meter.is_valid));
    fields.insert(
        "device_temperature".to_string(),
        FieldValue::F64(status.temperature),
    );
    fields.insert(
        "energy_wh".to_string(),
        FieldValue::F64(energy_wh(meter.power, interval_secs)),
    );
    Ok(Sample::success(device, ts, fields))
}

/// Three-phase sample with per-phase readings and summed totals.
pub fn normalize_three_em(
    device: &str,
    ts: DateTime<Utc>,
    interval_secs: u64,
    status: &ThreeEmStatus,
) -> Result<Sample> {
    if status.emeters.len() < PHASES.len() {
        return Err(AppError::Device(format!(
            "{device}: expected {} emeters, got {}",
            PHASES.len(),
            status.emeters.len()
        )));
    }

    let mut fields = BTreeMap::new();
    let mut total_power = 0.0;
    for (phase, meter) in PHASES.iter().zip(&status.emeters) {
        total_power += meter.power;
        let readings = [
            ("power", FieldValue::F64(meter.power)),
            ("power_factor", FieldValue::F64(meter.pf)),
            ("current", FieldValue::F64(meter.current)),
            ("voltage", FieldValue::F64(meter.voltage)),
            ("is_valid", FieldValue::Bool(meter.is_valid)),
            (
                "energy_wh",
                FieldValue::F64(energy_wh(meter.power, interval_secs)),
            ),
        ];
        for (name, value) in readings {
            fields.insert(format!("{name}_{phase}"), value);
        }
    }
    fields.insert("power".to_string(), FieldValue::F64(total_power));
    fields.insert(
        "energy_wh".to_string(),
        FieldValue::F64(energy_wh(total_power, interval_secs)),
    );
    Ok(Sample::success(device, ts, fields))
}

pub struct PlugS {
    client: reqwest::Client,
    failures: Arc<FailureLog>,
}

impl PlugS {
    pub fn new(client: reqwest::Client, failures: Arc<FailureLog>) -> Self {
        Self { client, failures }
    }
}

#[async_trait]
impl DeviceAdapter for PlugS {
    async fn fetch(&self, device: &DeviceConfig) -> Vec<Sample> {
        let outcome = get_status::<PlugStatus>(&self.client, &device.address).await;
        let ts = now();
        let outcome = outcome
            .and_then(|status| normalize_plug_s(&device.name, ts, device.update_time, &status));
        into_samples(&self.failures, device, ts, outcome)
    }
}

pub struct ThreeEm {
    client: reqwest::Client,
    failures: Arc<FailureLog>,
}

impl ThreeEm {
    pub fn new(client: reqwest::Client, failures: Arc<FailureLog>) -> Self {
        Self { client, failures }
    }
}

#[async_trait]
impl DeviceAdapter for ThreeEm {
    async fn fetch(&self, device: &DeviceConfig) -> Vec<Sample> {
        let outcome = get_status::<ThreeEmStatus>(&self.client, &device.address).await;
        let ts = now();
        let outcome = outcome
            .and_then(|status| normalize_three_em(&device.name, ts, device.update_time, &status));
        into_samples(&self.failures, device, ts, outcome)
    }
}
