use crate::error::{AppError, Result};
use chrono::NaiveTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use std::{fmt, fs, path::Path};
use tracing::warn;

pub const DEFAULT_PRICE_KWH: f64 = 0.30;
pub const DEFAULT_REQUEST_TIME: &str = "00:00";
pub const DEFAULT_DB_PORT: u16 = 8086;
pub const DEFAULT_REFERENCE_WH: f64 = 100.0;
pub const DEFAULT_ALARM_FACTOR: f64 = 1.2;
pub const DEFAULT_ALARM_PERIOD_MIN: u64 = 30;
pub const DEFAULT_ON_THRESHOLD: u32 = 2;
pub const DEFAULT_OFF_THRESHOLD: u32 = 1;

static TIME_OF_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[01]\d|2[0-3]):(?:[0-5]\d)$").expect("valid regex"));
static DAY_OF_MONTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}$").expect("valid regex"));
static DATE_OF_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}[.]\d{2}$").expect("valid regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub store: StoreConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct General {
    /// Price per kWh; a number or a string such as "0,35".
    #[serde(default)]
    pub price_kwh: Option<serde_yaml::Value>,
    /// Local time of day ("HH:MM") at which cost reports are produced.
    #[serde(default)]
    pub cost_calc_request_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How often an unverified store is checked again.
    #[serde(default = "default_reverify_interval_secs")]
    pub reverify_interval_secs: u64,
}

fn default_reverify_interval_secs() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            reverify_interval_secs: default_reverify_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Adapter key, e.g. "shelly:plug-s" or "shelly:3em".
    pub device_type: String,
    /// Host (and optional port) the device answers on.
    pub address: String,
    /// Sampling interval in seconds.
    pub update_time: u64,
    #[serde(default)]
    pub cost_calc_day: bool,
    /// Day of month ("DD") for the monthly report.
    #[serde(default)]
    pub cost_month: Option<String>,
    /// Day and month ("DD.MM") for the yearly report.
    #[serde(default)]
    pub cost_year: Option<String>,
    #[serde(default)]
    pub alarm: Option<AlarmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    #[serde(default = "default_reference_wh")]
    pub reference_wh: f64,
    /// Defaults to 1.2 x `reference_wh`.
    #[serde(default)]
    pub threshold_wh: Option<f64>,
    #[serde(default = "default_period_min")]
    pub period_min: u64,
    #[serde(default = "default_on_threshold")]
    pub on_threshold: u32,
    #[serde(default = "default_off_threshold")]
    pub off_threshold: u32,
}

fn default_reference_wh() -> f64 {
    DEFAULT_REFERENCE_WH
}
fn default_period_min() -> u64 {
    DEFAULT_ALARM_PERIOD_MIN
}
fn default_on_threshold() -> u32 {
    DEFAULT_ON_THRESHOLD
}
fn default_off_threshold() -> u32 {
    DEFAULT_OFF_THRESHOLD
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            reference_wh: DEFAULT_REFERENCE_WH,
            threshold_wh: None,
            period_min: DEFAULT_ALARM_PERIOD_MIN,
            on_threshold: DEFAULT_ON_THRESHOLD,
            off_threshold: DEFAULT_OFF_THRESHOLD,
        }
    }
}

impl AlarmConfig {
    pub fn threshold(&self) -> f64 {
        self.threshold_wh
            .unwrap_or(self.reference_wh * DEFAULT_ALARM_FACTOR)
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse
    /// and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_placeholders(raw)?;
        let cfg: Self = serde_yaml::from_str(&expanded)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(AppError::Config(
                "config must include at least one device".into(),
            ));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(AppError::Config("device name cannot be empty".into()));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
            if device.update_time == 0 {
                return Err(AppError::Config(format!(
                    "device '{}' update_time must be greater than 0",
                    device.name
                )));
            }
            if let Some(alarm) = &device.alarm {
                if alarm.on_threshold == 0 || alarm.off_threshold == 0 || alarm.period_min == 0 {
                    return Err(AppError::Config(format!(
                        "device '{}' alarm thresholds and period must be greater than 0",
                        device.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl General {
    /// Price per kWh rounded to 3 decimals, or 0.30 when unset or malformed.
    pub fn price_per_kwh(&self) -> f64 {
        let parsed = match &self.price_kwh {
            None => {
                warn!(default = DEFAULT_PRICE_KWH, "price_kwh not configured; using default");
                return DEFAULT_PRICE_KWH;
            }
            Some(serde_yaml::Value::Number(n)) => n.as_f64(),
            Some(serde_yaml::Value::String(s)) => s.trim().replace(',', ".").parse::<f64>().ok(),
            Some(_) => None,
        };
        match parsed {
            Some(price) if price.is_finite() && price >= 0.0 => round_to(price, 3),
            _ => {
                warn!(
                    value = ?self.price_kwh,
                    default = DEFAULT_PRICE_KWH,
                    "price_kwh is not a number; using default"
                );
                DEFAULT_PRICE_KWH
            }
        }
    }

    /// Time of day for scheduled cost reports; "00:00" when unset or invalid.
    pub fn request_time(&self) -> NaiveTime {
        let fallback = NaiveTime::MIN;
        match self.cost_calc_request_time.as_deref() {
            None => fallback,
            Some(raw) if TIME_OF_DAY.is_match(raw) => {
                NaiveTime::parse_from_str(raw, "%H:%M").unwrap_or(fallback)
            }
            Some(raw) => {
                warn!(
                    value = raw,
                    default = DEFAULT_REQUEST_TIME,
                    "cost_calc_request_time is not HH:MM; using default"
                );
                fallback
            }
        }
    }
}

/// Which cost reports a device asked for, after validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CostSchedule {
    pub day: bool,
    /// Day of month.
    pub month: Option<u32>,
    /// (day, month)
    pub year: Option<(u32, u32)>,
}

impl CostSchedule {
    /// Invalid schedule strings are logged and treated as not requested.
    pub fn from_device(device: &DeviceConfig) -> Self {
        let month = device
            .cost_month
            .as_deref()
            .and_then(|raw| match parse_day_of_month(raw) {
                Some(day) => Some(day),
                None => {
                    warn!(device = %device.name, value = raw, "invalid cost_month (expected DD); monthly report disabled");
                    None
                }
            });
        let year = device
            .cost_year
            .as_deref()
            .and_then(|raw| match parse_date_of_year(raw) {
                Some(date) => Some(date),
                None => {
                    warn!(device = %device.name, value = raw, "invalid cost_year (expected DD.MM); yearly report disabled");
                    None
                }
            });
        Self {
            day: device.cost_calc_day,
            month,
            year,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.day || self.month.is_some() || self.year.is_some()
    }
}

fn parse_day_of_month(raw: &str) -> Option<u32> {
    if !DAY_OF_MONTH.is_match(raw) {
        return None;
    }
    raw.parse().ok().filter(|d| (1..=31).contains(d))
}

fn parse_date_of_year(raw: &str) -> Option<(u32, u32)> {
    if !DATE_OF_YEAR.is_match(raw) {
        return None;
    }
    let (day, month) = raw.split_once('.')?;
    let day: u32 = day.parse().ok().filter(|d| (1..=31).contains(d))?;
    let month: u32 = month.parse().ok().filter(|m| (1..=12).contains(m))?;
    Some((day, month))
}

/// Login information for the time-series store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub ssl: bool,
    pub verify_ssl: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .field("verify_ssl", &self.verify_ssl)
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build credentials from any key lookup. Every missing required key is
    /// reported in one error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = lookup("DB_IP_ADDRESS");
        let username = lookup("DB_USER_NAME");
        let database = lookup("DB_NAME");
        let password = lookup("DB_USER_PASSWORD").unwrap_or_default();

        let missing: Vec<&str> = [
            ("DB_IP_ADDRESS", host.is_none()),
            ("DB_USER_NAME", username.is_none()),
            ("DB_NAME", database.is_none()),
        ]
        .into_iter()
        .filter_map(|(key, absent)| absent.then_some(key))
        .collect();
        let (Some(host), Some(username), Some(database)) = (host, username, database) else {
            return Err(AppError::Config(format!(
                "missing environment variable(s): {}",
                missing.join(", ")
            )));
        };

        let port = match lookup("DB_PORT") {
            None => DEFAULT_DB_PORT,
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                AppError::Config("environment variable DB_PORT is not a port number".into())
            })?,
        };

        Ok(Self {
            host,
            port,
            username,
            password,
            database,
            ssl: parse_flag("SSL", lookup("SSL"))?,
            verify_ssl: parse_flag("VERIFY_SSL", lookup("VERIFY_SSL"))?,
        })
    }
}

fn parse_flag(key: &str, raw: Option<String>) -> Result<bool> {
    match raw.as_deref() {
        None => Ok(false),
        Some("True") | Some("true") => Ok(true),
        Some("False") | Some("false") => Ok(false),
        Some(_) => Err(AppError::Config(format!(
            "environment variable {key} is not True or False"
        ))),
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> std::result::Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
            }
            Some(open @ ('(' | '{')) => {
                it.next();
                let close = if open == '(' { ')' } else { '}' };
                let var = read_until(&mut it, close)
                    .with_context(|| format!("unterminated env placeholder: missing '{close}'"))?;
                let val = std::env::var(&var)
                    .with_context(|| format!("missing environment variable: {}", var))?;
                out.push_str(&val);
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

/// Read characters until we hit `end`, consuming the delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
