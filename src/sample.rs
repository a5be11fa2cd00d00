use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Measurement (table) every sample is stored under.
pub const MEASUREMENT: &str = "census";

/// One normalized observation of a device.
///
/// A sample with `fetch_success == false` carries no fields; the accessors
/// below return `None` for it even if fields were attached by mistake, so no
/// consumer can read power or energy from a failed fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub ts: DateTime<Utc>,
    pub device: String,
    pub fetch_success: bool,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Typed field value.
///
/// The Shelly adapters only produce `F64` and `Bool`. `I64` and `Text` exist
/// because rows read back from the store are decoded by column type (INT4,
/// INT8, TEXT), and so adapters registered at runtime can carry counters or
/// labels without a schema change.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    F64(f64),
    I64(i64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::F64(v) => Some(*v),
            FieldValue::I64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl Sample {
    pub fn success(
        device: impl Into<String>,
        ts: DateTime<Utc>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Self {
        Self {
            ts,
            device: device.into(),
            fetch_success: true,
            fields,
        }
    }

    pub fn failure(device: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            device: device.into(),
            fetch_success: false,
            fields: BTreeMap::new(),
        }
    }

    /// Numeric field value, only for successful samples.
    pub fn field_f64(&self, name: &str) -> Option<f64> {
        if !self.fetch_success {
            return None;
        }
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    pub fn field_bool(&self, name: &str) -> Option<bool> {
        if !self.fetch_success {
            return None;
        }
        self.fields.get(name).and_then(FieldValue::as_bool)
    }

    pub fn energy_wh(&self) -> Option<f64> {
        self.field_f64("energy_wh")
    }

    pub fn power(&self) -> Option<f64> {
        self.field_f64("power")
    }
}

/// Energy drawn at a constant `power_w` over one sampling interval.
pub fn energy_wh(power_w: f64, interval_secs: u64) -> f64 {
    power_w * interval_secs as f64 / 3600.0
}
