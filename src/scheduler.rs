//! Per-device background tasks
//!
//! Every device gets its own poll task, a cost-report task when reports are
//! requested and an alarm task when alarm parameters are configured. Tasks
//! for different devices never wait on each other.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::adapters::{AdapterRegistry, Escalation, Streak, TIMEOUT_RESPONSE_TIME};
use crate::alarm::AlarmDetector;
use crate::config::{Config, CostSchedule, DeviceConfig};
use crate::cost::{run_cost_report, WindowKind};
use crate::error::{AppError, Result};
use crate::notify::Notifier;
use crate::store::{TimeSeriesStore, TimescaleGateway};

/// Deadline for one poll: the device request plus the store write.
pub const POLL_DEADLINE: Duration = Duration::from_secs(TIMEOUT_RESPONSE_TIME.as_secs() + 25);

/// Deadline for one cost report or alarm evaluation.
pub const AGGREGATION_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often cost schedules are checked (default: 60 seconds)
    pub check_interval_secs: u64,
    /// How often an unverified store is checked again
    pub reverify_interval_secs: u64,
    pub poll_deadline: Duration,
    /// Applies to each cost report and each alarm evaluation
    pub aggregation_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            reverify_interval_secs: 300,
            poll_deadline: POLL_DEADLINE,
            aggregation_deadline: AGGREGATION_DEADLINE,
        }
    }
}

pub struct Scheduler {
    config: Config,
    settings: SchedulerConfig,
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn TimeSeriesStore>,
    notifier: Arc<dyn Notifier>,
    gateway: Option<Arc<TimescaleGateway>>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn TimeSeriesStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let settings = SchedulerConfig {
            reverify_interval_secs: config.store.reverify_interval_secs,
            ..SchedulerConfig::default()
        };
        Self {
            config,
            settings,
            registry,
            store,
            notifier,
            gateway: None,
        }
    }

    /// Re-run the gateway's verification while it is unverified.
    pub fn with_reverification(mut self, gateway: Arc<TimescaleGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_settings(mut self, settings: SchedulerConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Spawn all device tasks. Dropping or shutting down the returned set
    /// aborts them.
    pub fn spawn(self) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        let price_kwh = self.config.general.price_per_kwh();
        let request_time = self.config.general.request_time();

        for device in &self.config.devices {
            if self.registry.contains(&device.device_type) {
                tasks.spawn(poll_loop(
                    device.clone(),
                    self.registry.clone(),
                    self.store.clone(),
                    self.settings.poll_deadline,
                ));
            } else {
                let err = AppError::UnknownDeviceType {
                    device: device.name.clone(),
                    device_type: device.device_type.clone(),
                };
                tracing::error!(device = %device.name, error = %err, "device will not be polled");
            }

            let schedule = CostSchedule::from_device(device);
            if schedule.is_requested() {
                tasks.spawn(cost_loop(
                    device.clone(),
                    schedule,
                    request_time,
                    price_kwh,
                    self.settings.check_interval_secs,
                    self.settings.aggregation_deadline,
                    self.store.clone(),
                    self.notifier.clone(),
                ));
            }

            if let Some(alarm) = &device.alarm {
                let detector = AlarmDetector::new(&device.name, alarm, device.update_time);
                tasks.spawn(alarm_loop(
                    detector,
                    alarm.period_min,
                    self.settings.aggregation_deadline,
                    self.store.clone(),
                    self.notifier.clone(),
                ));
            }
        }

        if let Some(gateway) = self.gateway {
            tasks.spawn(reverify_loop(gateway, self.settings.reverify_interval_secs));
        }

        tracing::info!(
            "Scheduler started: {} device(s), {} task(s)",
            self.config.devices.len(),
            tasks.len()
        );
        tasks
    }
}

/// Fetch one device and persist its samples in fetch order.
pub async fn poll_once(
    device: &DeviceConfig,
    registry: &AdapterRegistry,
    store: &dyn TimeSeriesStore,
) -> Result<usize> {
    let samples = registry.dispatch(device).await?;
    store.write(&samples).await?;
    Ok(samples.len())
}

/// Run `fut` to completion or give up after `deadline`.
pub async fn with_deadline<T>(
    task: &'static str,
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::DeadlineExceeded {
            task,
            secs: deadline.as_secs(),
        }),
    }
}

async fn poll_loop(
    device: DeviceConfig,
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn TimeSeriesStore>,
    deadline: Duration,
) {
    tracing::info!(
        device = %device.name,
        device_type = %device.device_type,
        "Polling every {}s",
        device.update_time
    );
    let mut ticker = interval(Duration::from_secs(device.update_time));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // an unverified store fails every poll; escalate once then go quiet
    let mut failures = Streak::default();
    loop {
        ticker.tick().await;
        match with_deadline("poll", deadline, poll_once(&device, &registry, &*store)).await {
            Ok(count) => {
                if let Some(streak) = failures.recover() {
                    tracing::info!(device = %device.name, failed_polls = streak, "poll results persisted again");
                }
                tracing::debug!(device = %device.name, samples = count, "poll stored")
            }
            Err(e) => match failures.fail() {
                Escalation::Report => {
                    tracing::error!(device = %device.name, error = %e, "poll result not persisted")
                }
                Escalation::Escalate => tracing::error!(
                    device = %device.name,
                    streak = failures.count(),
                    error = %e,
                    "poll results keep failing; further failures are logged at debug level"
                ),
                Escalation::Quiet => tracing::debug!(
                    device = %device.name,
                    streak = failures.count(),
                    error = %e,
                    "poll result not persisted"
                ),
            },
        }
    }
}

/// Window kinds due at local time `now`, skipping kinds already produced
/// on that calendar day.
///
/// A kind is due from `request_time` until the end of its day, so a check
/// that misses the exact minute (a slow tick, a restart, a clock jump over
/// the request time) still produces that day's report on the next check.
pub fn due_windows(
    schedule: &CostSchedule,
    request_time: NaiveTime,
    now: NaiveDateTime,
    fired: &HashMap<WindowKind, NaiveDate>,
) -> Vec<WindowKind> {
    if now.time() < request_time {
        return Vec::new();
    }
    let today = now.date();
    WindowKind::ALL
        .into_iter()
        .filter(|kind| match kind {
            WindowKind::Day => schedule.day,
            WindowKind::Month => schedule.month == Some(today.day()),
            WindowKind::Year => schedule.year == Some((today.day(), today.month())),
        })
        .filter(|kind| fired.get(kind) != Some(&today))
        .collect()
}

async fn cost_loop(
    device: DeviceConfig,
    schedule: CostSchedule,
    request_time: NaiveTime,
    price_kwh: f64,
    check_interval_secs: u64,
    deadline: Duration,
    store: Arc<dyn TimeSeriesStore>,
    notifier: Arc<dyn Notifier>,
) {
    tracing::info!(
        device = %device.name,
        ?schedule,
        "Cost reports at {}",
        request_time.format("%H:%M")
    );
    let mut fired: HashMap<WindowKind, NaiveDate> = HashMap::new();
    let mut ticker = interval(Duration::from_secs(check_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let local = Local::now().naive_local();
        for kind in due_windows(&schedule, request_time, local, &fired) {
            fired.insert(kind, local.date());
            // the window ends now, so it has fully elapsed
            let end = Utc::now();
            let report = run_cost_report(
                &*store,
                &*notifier,
                &device.name,
                device.update_time,
                kind,
                end,
                price_kwh,
            );
            match with_deadline("cost report", deadline, report).await {
                Ok(Some(_)) => tracing::info!(device = %device.name, window = %kind, "cost report emitted"),
                Ok(None) => {}
                Err(e @ AppError::DeadlineExceeded { .. }) => tracing::warn!(
                    device = %device.name,
                    window = %kind,
                    error = %e,
                    "cost report abandoned"
                ),
                Err(e) => tracing::error!(
                    device = %device.name,
                    window = %kind,
                    error = %e,
                    "cost report skipped"
                ),
            }
        }
    }
}

async fn alarm_loop(
    mut detector: AlarmDetector,
    period_min: u64,
    deadline: Duration,
    store: Arc<dyn TimeSeriesStore>,
    notifier: Arc<dyn Notifier>,
) {
    let mut ticker = interval(Duration::from_secs(period_min.max(1) * 60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate; wait for a full period instead.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let evaluation = detector.evaluate(&*store, &*notifier, Utc::now());
        let outcome = with_deadline("alarm evaluation", deadline, evaluation).await;
        match outcome {
            Ok(_) => {}
            Err(e @ AppError::DeadlineExceeded { .. }) => {
                tracing::warn!(device = %detector.machine().device(), error = %e, "alarm evaluation abandoned")
            }
            Err(e) => tracing::error!(error = %e, "alarm evaluation skipped"),
        }
    }
}

async fn reverify_loop(gateway: Arc<TimescaleGateway>, interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !gateway.is_verified() {
            tracing::info!("Retrying time-series store verification");
            gateway.verify().await;
        }
    }
}
