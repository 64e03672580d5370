//! Polling loop and service assembly against the simulator

#![allow(clippy::disallowed_methods)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use stationsrv::config::{DeviceConfig, StationsrvConfig};
use stationsrv::service::{DevicePoller, ReconnectPolicy, StationService};
use stationsrv::sink::{ChannelSink, Measurement, StatusEvent};
use stationsrv::station::{AlarmSeverity, ChannelValue, ConnectionStatus, Device};

use support::{pump_station, settings, start};

const INTERVAL: Duration = Duration::from_millis(50);

async fn recv<T>(rx: &mut Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("sink closed")
}

async fn next_status(rx: &mut Receiver<StatusEvent>) -> ConnectionStatus {
    match recv(rx).await {
        StatusEvent::Connection { status, .. } => status,
        other => panic!("expected a connection event, got {other:?}"),
    }
}

fn poller(device: Arc<Device>, sink: &ChannelSink) -> DevicePoller {
    let sink = Arc::new(sink.clone());
    DevicePoller::new(device, INTERVAL, sink.clone(), sink)
}

#[tokio::test]
async fn test_poller_reports_discovery_and_measurements() {
    let sim = pump_station();
    let (addr, sim_cancel) = start(&sim).await;
    let device = Arc::new(Device::new("pump-1", addr.to_string(), 1, settings()));
    let (sink, mut measurements, mut status) = ChannelSink::new(64);

    let cancel = CancellationToken::new();
    let handle = poller(Arc::clone(&device), &sink).spawn(cancel.clone());
    drop(sink);

    assert_eq!(next_status(&mut status).await, ConnectionStatus::Connecting);
    assert_eq!(next_status(&mut status).await, ConnectionStatus::Connected);

    let mut discovered = Vec::new();
    for _ in 0..6 {
        match recv(&mut status).await {
            StatusEvent::ChannelDiscovered { device, tag, title } => {
                assert_eq!(device, "pump-1");
                discovered.push((tag.to_string(), title));
            },
            other => panic!("expected discovery, got {other:?}"),
        }
    }
    assert_eq!(discovered[0], ("AI-0".to_string(), "Inlet pressure".to_string()));
    assert_eq!(discovered[5], ("VO-0".to_string(), "VO-0".to_string()));

    let first: Vec<Measurement> = {
        let mut batch = Vec::new();
        for _ in 0..5 {
            batch.push(recv(&mut measurements).await);
        }
        batch
    };
    assert!(first.iter().all(|m| m.device == "pump-1"));
    assert_eq!(first[0].tag.to_string(), "AI-0");
    assert_eq!(first[0].value, ChannelValue::Analog(95.0));
    assert_eq!(first[0].alarm, Some(AlarmSeverity::HighHigh));

    // Later polls bring measurements but no further discovery
    let again = recv(&mut measurements).await;
    assert_eq!(again.tag.to_string(), "AI-0");

    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(device.status(), ConnectionStatus::Disconnected);

    let mut rest = Vec::new();
    while let Some(event) = status.recv().await {
        rest.push(event);
    }
    assert_eq!(
        rest,
        vec![StatusEvent::Connection {
            device: "pump-1".to_string(),
            status: ConnectionStatus::Disconnected,
        }]
    );

    sim_cancel.cancel();
}

#[tokio::test]
async fn test_poller_reconnects_after_controller_loss() {
    let sim = pump_station();
    let (addr, sim_cancel) = start(&sim).await;
    let device = Arc::new(Device::new("pump-1", addr.to_string(), 1, settings()));
    let (sink, mut measurements, mut status) = ChannelSink::new(64);

    let cancel = CancellationToken::new();
    let handle = poller(Arc::clone(&device), &sink).spawn(cancel.clone());

    assert_eq!(next_status(&mut status).await, ConnectionStatus::Connecting);
    assert_eq!(next_status(&mut status).await, ConnectionStatus::Connected);
    recv(&mut measurements).await;
    drop(measurements);

    // Controller goes away: listener and open connections close
    sim_cancel.cancel();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        if let StatusEvent::Connection { status, .. } = recv(&mut status).await {
            seen.push(status);
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Disconnected,
        ]
    );
    assert_eq!(device.status(), ConnectionStatus::Disconnected);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_poller_stops_promptly_while_waiting() {
    let unused = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let device = Arc::new(Device::new("ghost", unused.to_string(), 1, settings()));
    let (sink, _measurements, mut status) = ChannelSink::new(64);

    let cancel = CancellationToken::new();
    let sink = Arc::new(sink);
    let handle = DevicePoller::new(device, Duration::from_secs(3600), sink.clone(), sink)
        .spawn(cancel.clone());

    assert_eq!(next_status(&mut status).await, ConnectionStatus::Connecting);
    assert_eq!(next_status(&mut status).await, ConnectionStatus::Disconnected);

    // The hour-long reconnect delay must not hold up shutdown
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("poller did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_bounded_reconnect_policy_ends_poller() {
    let unused = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let device = Arc::new(Device::new("ghost", unused.to_string(), 1, settings()));
    let (sink, _measurements, mut status) = ChannelSink::new(64);
    let policy = ReconnectPolicy::every(Duration::from_millis(10)).with_max_attempts(2);
    let handle = poller(device, &sink)
        .with_reconnect_policy(policy)
        .spawn(CancellationToken::new());
    drop(sink);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("poller kept retrying")
        .unwrap();

    let mut seen = Vec::new();
    while let Some(event) = status.recv().await {
        if let StatusEvent::Connection { status, .. } = event {
            seen.push(status);
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Disconnected,
        ]
    );
}

#[tokio::test]
async fn test_service_runs_configured_devices() {
    let sim = pump_station();
    let (addr, sim_cancel) = start(&sim).await;

    let mut config = StationsrvConfig::default();
    config.service.polling_interval_ms = 50;
    config.transport.response_timeout_ms = 500;
    config.devices.push(DeviceConfig {
        name: "pump-1".to_string(),
        address: addr.to_string(),
        slave_id: 1,
        polling_interval_ms: None,
    });

    let (sink, mut measurements, mut status) = ChannelSink::new(64);
    let sink = Arc::new(sink);
    let cancel = CancellationToken::new();
    let service = StationService::start(&config, sink.clone(), sink, cancel.clone())
        .await
        .unwrap();
    assert!(service.rendezvous().is_none());
    assert_eq!(service.registry().names(), vec!["pump-1".to_string()]);

    assert_eq!(next_status(&mut status).await, ConnectionStatus::Connecting);
    assert_eq!(next_status(&mut status).await, ConnectionStatus::Connected);
    let m = recv(&mut measurements).await;
    assert_eq!(m.device, "pump-1");

    let device = service.registry().get("pump-1").unwrap();
    assert_eq!(device.status(), ConnectionStatus::Connected);
    assert_eq!(device.model().await.unwrap(), support::model());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), service.join())
        .await
        .expect("service did not stop");
    assert_eq!(device.status(), ConnectionStatus::Disconnected);

    sim_cancel.cancel();
}

#[tokio::test]
async fn test_service_rejects_duplicate_devices() {
    let mut config = StationsrvConfig::default();
    for _ in 0..2 {
        config.devices.push(DeviceConfig {
            name: "twin".to_string(),
            address: "127.0.0.1:502".to_string(),
            slave_id: 1,
            polling_interval_ms: None,
        });
    }
    let (sink, _m, _s) = ChannelSink::new(1);
    let sink = Arc::new(sink);
    let result = StationService::start(&config, sink.clone(), sink, CancellationToken::new()).await;
    assert!(matches!(result, Err(stationsrv::StationError::ConfigError(_))));
}
