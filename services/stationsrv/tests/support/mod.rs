//! Shared fixtures: a simulated pump station with one channel of every flavor

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use stationsrv::protocols::modbus::RetryPolicy;
use stationsrv::simulator::{serve, SimulatedStation};
use stationsrv::station::{
    AiDescriptor, AlarmConfig, AlarmThreshold, AoControlMode, AoDescriptor, ChannelCount,
    ChannelKind, ChannelTag, DeviceSettings, DiDescriptor, DoDescriptor, MacAddress, ModelInfo,
    NetworkAddress,
};
use tokio_util::sync::CancellationToken;

pub const MAC: &str = "00:1a:2b:3c:4d:5e";

pub fn tag(kind: ChannelKind, index: u16) -> ChannelTag {
    ChannelTag::new(kind, index)
}

pub fn counts() -> ChannelCount {
    ChannelCount::new(2, 1, 2, 1, 1)
}

pub fn model() -> ModelInfo {
    ModelInfo {
        id: 0x0002_0001,
        version: 3,
        title: "PS-200 Station".to_string(),
    }
}

pub fn network() -> NetworkAddress {
    NetworkAddress {
        ip: Ipv4Addr::new(192, 168, 1, 10),
        mask: Ipv4Addr::new(255, 255, 255, 0),
        gateway: Ipv4Addr::new(192, 168, 1, 1),
        mac: MAC.parse::<MacAddress>().unwrap(),
    }
}

pub fn alarm_config() -> AlarmConfig {
    AlarmConfig {
        hf: AlarmThreshold::enabled(100.0),
        hh: AlarmThreshold::enabled(90.0),
        hi: AlarmThreshold::enabled(80.0),
        lo: AlarmThreshold::enabled(20.0),
        ll: AlarmThreshold::enabled(10.0),
        lf: AlarmThreshold::enabled(0.0),
        deadband: 2.0,
        low_cut: 0.5,
    }
}

pub fn ai(index: u16, title: &str, alarm: Option<AlarmConfig>) -> AiDescriptor {
    AiDescriptor {
        index,
        enabled: true,
        title: title.to_string(),
        decimal_places: 2,
        unit: "kPa".to_string(),
        gain: 1.0,
        offset: 0.0,
        min: 0.0,
        max: 120.0,
        alarm,
    }
}

pub fn do_(index: u16, title: &str, enabled: bool, auto_control: bool) -> DoDescriptor {
    DoDescriptor {
        index,
        enabled,
        title: title.to_string(),
        auto_control,
        manual_value: false,
        reverse: false,
        on_timer_secs: 0,
        off_timer_secs: 0,
    }
}

/// AI-0 high-high, AI-1 not sampled, DI-0 on, DO-0 off (manual),
/// DO-1 disabled, AO-0 42.5 Hz, VO-0 7.0
pub fn pump_station() -> Arc<SimulatedStation> {
    let sim = SimulatedStation::new();
    sim.install_model(&model());
    sim.install_network(&network());
    sim.install_counts(counts());

    sim.install_ai(&ai(0, "Inlet pressure", Some(alarm_config())))
        .unwrap();
    sim.install_ai(&ai(1, "Outlet pressure", Some(alarm_config())))
        .unwrap();
    sim.install_di(&DiDescriptor {
        index: 0,
        enabled: true,
        title: "Door open".to_string(),
        inverse: false,
        alarm_enabled: true,
        alarm_delay_secs: 5,
    })
    .unwrap();
    sim.install_do(&do_(0, "Main pump", true, false)).unwrap();
    sim.install_do(&do_(1, "Spare", false, true)).unwrap();
    sim.install_ao(&AoDescriptor {
        index: 0,
        enabled: true,
        title: "Speed reference".to_string(),
        mode: AoControlMode::Manual,
        p: 1.0,
        i: 0.1,
        d: 0.0,
        manual_value: 42.5,
        unit: "Hz".to_string(),
        decimal_places: 1,
    })
    .unwrap();

    sim.set_analog(tag(ChannelKind::Ai, 0), 95.0).unwrap();
    sim.set_not_ready(tag(ChannelKind::Ai, 1), 1).unwrap();
    sim.set_digital(tag(ChannelKind::Di, 0), true).unwrap();
    sim.set_digital(tag(ChannelKind::Do, 0), false).unwrap();
    sim.set_digital(tag(ChannelKind::Do, 1), true).unwrap();
    sim.set_analog(tag(ChannelKind::Ao, 0), 42.5).unwrap();
    sim.set_analog(tag(ChannelKind::Vo, 0), 7.0).unwrap();
    sim
}

/// Short timeouts, no real-time caching
pub fn settings() -> DeviceSettings {
    DeviceSettings {
        connect_timeout: Duration::from_secs(1),
        response_timeout: Duration::from_millis(200),
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
        },
        realtime_ttl: Duration::ZERO,
        max_registers_per_read: 124,
    }
}

pub async fn start(sim: &Arc<SimulatedStation>) -> (SocketAddr, CancellationToken) {
    let cancel = CancellationToken::new();
    let addr = serve(Arc::clone(sim), "127.0.0.1:0", cancel.clone())
        .await
        .unwrap();
    (addr, cancel)
}
