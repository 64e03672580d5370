//! Per-device polling loop
//!
//! Connect, then poll on an interval until a poll fails; on failure close the
//! device, report Disconnected, wait one reconnect delay and start over. Every
//! wait races the shutdown token.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::reconnect::{ReconnectError, ReconnectHelper, ReconnectPolicy};
use crate::sink::{Measurement, MeasurementSink, StatusEvent, StatusSink};
use crate::station::{ConnectionStatus, Device, RealtimeReport};

pub struct DevicePoller {
    device: Arc<Device>,
    interval: Duration,
    reconnect: ReconnectHelper,
    measurements: Arc<dyn MeasurementSink>,
    status: Arc<dyn StatusSink>,
}

impl DevicePoller {
    /// Reconnects are paced at `interval` unless a policy is supplied
    pub fn new(
        device: Arc<Device>,
        interval: Duration,
        measurements: Arc<dyn MeasurementSink>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            device,
            interval,
            reconnect: ReconnectHelper::new(ReconnectPolicy::every(interval)),
            measurements,
            status,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = ReconnectHelper::new(policy);
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let span = info_span!("poll", device = %self.device.name());
        tokio::spawn(self.run(cancel).instrument(span))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let name = self.device.name().to_string();
        info!("Poller for {} started (interval {:?})", name, self.interval);

        while !cancel.is_cancelled() {
            if !self.connect(&cancel).await {
                break;
            }
            if self.device.status() == ConnectionStatus::Connected {
                self.poll_until_failure(&cancel).await;
            }
            if cancel.is_cancelled() {
                break;
            }

            let Some(delay) = self.reconnect.next_delay() else {
                let stats = self.reconnect.stats();
                error!(
                    "Giving up on {} after {} failed attempts (last error: {})",
                    name,
                    stats.failures,
                    stats.last_error.as_deref().unwrap_or("none")
                );
                break;
            };
            debug!("Next connect attempt for {} in {:?}", name, delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }

        self.device.close().await;
        self.emit_status(ConnectionStatus::Disconnected).await;
        info!("Poller for {} stopped", name);
    }

    /// One connect attempt; false means stop the loop
    async fn connect(&mut self, cancel: &CancellationToken) -> bool {
        self.emit_status(ConnectionStatus::Connecting).await;
        let device = Arc::clone(&self.device);
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = self.reconnect.execute_reconnect(|| async move { device.connect().await }) => result,
        };
        match attempt {
            Ok(()) => {
                self.emit_status(ConnectionStatus::Connected).await;
                true
            },
            Err(ReconnectError::MaxAttemptsExceeded(_)) => false,
            Err(ReconnectError::ConnectionFailed(_)) => {
                self.emit_status(ConnectionStatus::Disconnected).await;
                true
            },
        }
    }

    async fn poll_until_failure(&mut self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {},
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.device.poll_realtime() => result,
            };
            match result {
                Ok(report) => self.publish(report).await,
                Err(e) => {
                    warn!("Polling {} failed, reconnecting: {}", self.device.name(), e);
                    self.device.close().await;
                    self.emit_status(ConnectionStatus::Disconnected).await;
                    return;
                },
            }
        }
    }

    async fn publish(&self, report: RealtimeReport) {
        let device = self.device.name();
        for (tag, title) in report.discovered {
            let event = StatusEvent::ChannelDiscovered {
                device: device.to_string(),
                tag,
                title,
            };
            if let Err(e) = self.status.notify(event).await {
                warn!("Status sink rejected discovery for {}: {}", device, e);
            }
        }

        let now = Utc::now();
        let batch: Vec<Measurement> = report
            .readings
            .into_iter()
            .filter_map(|r| Measurement::from_reading(device, r, now))
            .collect();
        debug!(
            "{}: {} measurements, register time {:?}",
            device,
            batch.len(),
            report.elapsed
        );
        if let Err(e) = self.measurements.publish(batch).await {
            warn!("Measurement sink rejected batch for {}: {}", device, e);
        }
    }

    async fn emit_status(&self, status: ConnectionStatus) {
        let event = StatusEvent::Connection {
            device: self.device.name().to_string(),
            status,
        };
        if let Err(e) = self.status.notify(event).await {
            warn!("Status sink rejected {} for {}: {}", status, self.device.name(), e);
        }
    }
}
