use crate::alarm::AlarmEvent;
use crate::cost::CostReport;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

/// Structured output handed to whatever front-end delivers messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Alarm(AlarmEvent),
    CostReport(CostReport),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        match notification {
            Notification::Alarm(event) => info!(
                device = %event.device,
                state = %event.state,
                observed_wh = event.observed_wh,
                threshold_wh = event.threshold_wh,
                "{}",
                event
            ),
            Notification::CostReport(report) => info!(
                device = %report.device,
                window = %report.kind,
                error_rate_one = report.error_rate_one,
                error_rate_two = report.error_rate_two,
                "{}",
                report
            ),
        }
        Ok(())
    }
}

/// Forwards notifications to an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .await
            .map_err(|_| AppError::Other(anyhow::anyhow!("notification receiver dropped")))
    }
}
