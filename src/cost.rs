//! Day, month and year energy-cost reports.
//!
//! All window kinds share [`compute_report`]; only the window bounds differ.

use crate::config::round_to;
use crate::error::{AppError, Result};
use crate::notify::{Notification, Notifier};
use crate::sample::Sample;
use crate::store::{SampleQuery, TimeRange, TimeSeriesStore};
use chrono::{DateTime, Duration, Months, Utc};
use std::fmt;
use tracing::debug;

const REPORT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WindowKind {
    Day,
    Month,
    Year,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [WindowKind::Day, WindowKind::Month, WindowKind::Year];

    pub fn label(&self) -> &'static str {
        match self {
            WindowKind::Day => "day",
            WindowKind::Month => "month",
            WindowKind::Year => "year",
        }
    }

    /// `[now - 1 unit, now)`; month and year go back by calendar units.
    pub fn range_ending_at(&self, now: DateTime<Utc>) -> Result<TimeRange> {
        let start = match self {
            WindowKind::Day => now.checked_sub_signed(Duration::hours(24)),
            WindowKind::Month => now.checked_sub_months(Months::new(1)),
            WindowKind::Year => now.checked_sub_months(Months::new(12)),
        }
        .ok_or_else(|| AppError::Other(anyhow::anyhow!("{} window before {now} is out of range", self)))?;
        Ok(TimeRange::new(start, now))
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Elapsed window plus the device's sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    pub range: TimeRange,
    pub interval_secs: u64,
}

impl AggregationWindow {
    pub fn for_kind(kind: WindowKind, now: DateTime<Utc>, interval_secs: u64) -> Result<Self> {
        Ok(Self {
            range: kind.range_ending_at(now)?,
            interval_secs,
        })
    }

    pub fn duration_secs(&self) -> f64 {
        (self.range.end - self.range.start).num_milliseconds() as f64 / 1000.0
    }

    /// Samples the device should have produced over the window.
    pub fn expected_count(&self) -> f64 {
        if self.interval_secs == 0 {
            return 0.0;
        }
        self.duration_secs() / self.interval_secs as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostReport {
    pub device: String,
    pub kind: WindowKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Unrounded; rendering rounds to two decimals.
    pub sum_energy_kwh: f64,
    pub price_kwh: f64,
    pub total_cost: f64,
    /// Share of returned samples that are failures, in percent.
    pub error_rate_one: f64,
    /// Share of expected samples that never succeeded, in percent.
    pub error_rate_two: f64,
}

impl fmt::Display for CostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}: {} to {}: {:.2} kWh at {:.3}/kWh = {:.3} (error rate returned {:.1}%, expected {:.1}%)",
            self.device,
            self.kind,
            self.start.format(REPORT_TIMESTAMP_FORMAT),
            self.end.format(REPORT_TIMESTAMP_FORMAT),
            self.sum_energy_kwh,
            self.price_kwh,
            self.total_cost,
            self.error_rate_one,
            self.error_rate_two
        )
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        return 0.0;
    }
    (part * 100.0 / whole).clamp(0.0, 100.0)
}

/// Statistics for one window. `None` when the window holds no samples.
pub fn compute_report(
    device: &str,
    kind: WindowKind,
    window: &AggregationWindow,
    samples: &[Sample],
    price_kwh: f64,
) -> Option<CostReport> {
    if samples.is_empty() {
        return None;
    }
    let (success, failed): (Vec<&Sample>, Vec<&Sample>) =
        samples.iter().partition(|s| s.fetch_success);
    let success_count = success.len() as f64;
    let failed_count = failed.len() as f64;

    let sum_energy_wh: f64 = success.iter().filter_map(|s| s.energy_wh()).sum();
    let sum_energy_kwh = sum_energy_wh / 1000.0;
    let price_kwh = round_to(price_kwh, 3);
    let expected = window.expected_count();

    Some(CostReport {
        device: device.to_string(),
        kind,
        start: window.range.start,
        end: window.range.end,
        sum_energy_kwh,
        price_kwh,
        total_cost: sum_energy_kwh * price_kwh,
        error_rate_one: percent(failed_count, failed_count + success_count),
        error_rate_two: percent(expected - success_count, expected),
    })
}

/// Query the window ending at `now` and hand the report, if any, to the
/// notifier. Returns the emitted report.
pub async fn run_cost_report(
    store: &dyn TimeSeriesStore,
    notifier: &dyn Notifier,
    device: &str,
    interval_secs: u64,
    kind: WindowKind,
    now: DateTime<Utc>,
    price_kwh: f64,
) -> Result<Option<CostReport>> {
    let window = AggregationWindow::for_kind(kind, now, interval_secs)?;
    let samples = store
        .query(&SampleQuery::census(device, window.range))
        .await?;

    let Some(report) = compute_report(device, kind, &window, &samples, price_kwh) else {
        debug!(device = %device, window = %kind, "no samples in window; no cost report");
        return Ok(None);
    };
    notifier
        .notify(Notification::CostReport(report.clone()))
        .await?;
    Ok(Some(report))
}
