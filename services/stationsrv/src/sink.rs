//! Outbound sinks for measurements and status events

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{ErrorExt, Result};
use crate::station::{AlarmSeverity, ChannelReading, ChannelTag, ChannelValue, ConnectionStatus};

/// One decoded channel value, as published per polling cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub device: String,
    pub tag: ChannelTag,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm: Option<AlarmSeverity>,
    pub value: ChannelValue,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// `None` for readings without a value
    pub fn from_reading(device: &str, reading: ChannelReading, timestamp: DateTime<Utc>) -> Option<Self> {
        let value = reading.value?;
        Some(Self {
            device: device.to_string(),
            tag: reading.tag,
            title: reading.title,
            unit: reading.unit,
            alarm: reading.alarm,
            value,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Connection {
        device: String,
        status: ConnectionStatus,
    },
    ChannelDiscovered {
        device: String,
        tag: ChannelTag,
        title: String,
    },
}

#[async_trait]
pub trait MeasurementSink: Send + Sync {
    async fn publish(&self, batch: Vec<Measurement>) -> Result<()>;
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn notify(&self, event: StatusEvent) -> Result<()>;
}

/// Forwards everything into bounded channels
#[derive(Debug, Clone)]
pub struct ChannelSink {
    measurements: mpsc::Sender<Measurement>,
    status: mpsc::Sender<StatusEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Measurement>, mpsc::Receiver<StatusEvent>) {
        let (mtx, mrx) = mpsc::channel(capacity);
        let (stx, srx) = mpsc::channel(capacity);
        (
            Self {
                measurements: mtx,
                status: stx,
            },
            mrx,
            srx,
        )
    }
}

#[async_trait]
impl MeasurementSink for ChannelSink {
    async fn publish(&self, batch: Vec<Measurement>) -> Result<()> {
        for m in batch {
            self.measurements
                .send(m)
                .await
                .io_error("Measurement receiver dropped")?;
        }
        Ok(())
    }
}

#[async_trait]
impl StatusSink for ChannelSink {
    async fn notify(&self, event: StatusEvent) -> Result<()> {
        self.status
            .send(event)
            .await
            .io_error("Status receiver dropped")
    }
}

/// Writes JSON lines through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl MeasurementSink for LogSink {
    async fn publish(&self, batch: Vec<Measurement>) -> Result<()> {
        for m in &batch {
            info!(target: "stationsrv::measurement", "{}", serde_json::to_string(m)?);
        }
        Ok(())
    }
}

#[async_trait]
impl StatusSink for LogSink {
    async fn notify(&self, event: StatusEvent) -> Result<()> {
        info!(target: "stationsrv::status", "{}", serde_json::to_string(&event)?);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::station::ChannelKind;
    use tracing_test::traced_test;

    fn reading(value: Option<ChannelValue>) -> ChannelReading {
        ChannelReading {
            tag: ChannelTag::new(ChannelKind::Ai, 2),
            title: "Outlet".to_string(),
            unit: Some("m".to_string()),
            value,
            alarm: Some(AlarmSeverity::Normal),
            ctrl: None,
        }
    }

    #[test]
    fn test_from_reading_skips_missing_value() {
        let now = Utc::now();
        assert!(Measurement::from_reading("pump", reading(None), now).is_none());
        let m = Measurement::from_reading("pump", reading(Some(ChannelValue::Analog(3.5))), now).unwrap();
        assert_eq!(m.device, "pump");
        assert_eq!(m.tag.to_string(), "AI-2");
    }

    #[test]
    fn test_status_event_json() {
        let event = StatusEvent::ChannelDiscovered {
            device: "pump".to_string(),
            tag: ChannelTag::new(ChannelKind::Do, 0),
            title: "Valve".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "channel_discovered");
        assert_eq!(json["tag"], "DO-0");

        let event = StatusEvent::Connection {
            device: "pump".to_string(),
            status: ConnectionStatus::Connected,
        };
        assert_eq!(serde_json::to_value(&event).unwrap()["status"], "Connected");
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut measurements, mut status) = ChannelSink::new(8);
        let reading = reading(Some(ChannelValue::Analog(1.0)));
        let m = Measurement::from_reading("pump", reading, Utc::now()).unwrap();
        sink.publish(vec![m.clone()]).await.unwrap();
        assert_eq!(measurements.recv().await.unwrap(), m);

        sink.notify(StatusEvent::Connection {
            device: "pump".to_string(),
            status: ConnectionStatus::Disconnected,
        })
        .await
        .unwrap();
        assert!(matches!(status.recv().await.unwrap(), StatusEvent::Connection { .. }));

        drop(measurements);
        assert!(sink.publish(vec![m]).await.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_sink_writes_json() {
        let reading = reading(Some(ChannelValue::Analog(2.25)));
        let m = Measurement::from_reading("pump", reading, Utc::now()).unwrap();
        LogSink.publish(vec![m]).await.unwrap();
        assert!(logs_contain("\"tag\":\"AI-2\""));
        assert!(logs_contain("\"value\":2.25"));
    }
}
