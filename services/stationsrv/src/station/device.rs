//! Device: connection state machine and channel caches
//!
//! Every operation that touches the link or the caches runs under the
//! device's own async mutex, so a status read racing a scheduled poll never
//! interleaves register traffic. Caches are dropped together on connect,
//! reset, close and on any link failure.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::alarm::{evaluate, AlarmSeverity};
use super::channel::{ChannelCount, ChannelKind, ChannelTag};
use super::descriptor::{
    expect_len, AiDescriptor, AlarmConfig, AoDescriptor, DiDescriptor, DoDescriptor,
};
use super::identity::{ModelInfo, NetworkAddress};
use super::realtime::{RealtimeCache, RealtimeSnapshot};
use super::register_map::{
    descriptor_address, descriptor_main_regs, has_descriptor, AI_ALARM_OFFSET, AI_ALARM_REGS,
    CHANNEL_COUNT_ADDR, CHANNEL_COUNT_REGS, MAX_CHANNELS_PER_KIND, MODEL_ADDR, MODEL_REGS, NETWORK_ADDR,
    NETWORK_REGS,
};
use crate::connector::{select_connector, Connector, RendezvousListener};
use crate::error::{Result, StationError};
use crate::protocols::modbus::{ResilientTransport, RetryPolicy, TransportStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        };
        f.write_str(s)
    }
}

/// Link and cache tuning for one device
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub retry: RetryPolicy,
    pub realtime_ttl: Duration,
    pub max_registers_per_read: u16,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(6),
            response_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            realtime_ttl: Duration::from_secs(1),
            max_registers_per_read: 124,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Analog(f32),
    Digital(bool),
}

/// Live value of one channel plus its descriptor metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReading {
    pub tag: ChannelTag,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// `None` when the controller has not sampled the channel
    pub value: Option<ChannelValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm: Option<AlarmSeverity>,
    /// For digital outputs: true when under manual control
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctrl: Option<bool>,
}

/// Result of one polling cycle
#[derive(Debug, Clone, Default)]
pub struct RealtimeReport {
    pub readings: Vec<ChannelReading>,
    /// Channels seen for the first time, or whose title changed
    pub discovered: Vec<(ChannelTag, String)>,
    /// Accumulated register I/O time; zero when served from cache
    pub elapsed: Duration,
}

/// Everything fetched from the controller during one connection lifetime
#[derive(Debug, Default)]
struct ChannelCache {
    model: Option<ModelInfo>,
    network: Option<NetworkAddress>,
    counts: Option<ChannelCount>,
    ai: HashMap<u16, AiDescriptor>,
    ao: HashMap<u16, AoDescriptor>,
    di: HashMap<u16, DiDescriptor>,
    dout: HashMap<u16, DoDescriptor>,
}

struct DeviceState {
    connector: Option<Arc<dyn Connector>>,
    transport: Option<Arc<ResilientTransport>>,
    cache: ChannelCache,
    realtime: RealtimeCache,
    /// Announced tag → title, survives reconnects
    seen_titles: HashMap<ChannelTag, String>,
}

pub struct Device {
    name: String,
    address: String,
    slave_id: u8,
    settings: DeviceSettings,
    rendezvous: Option<Arc<RendezvousListener>>,
    status: RwLock<ConnectionStatus>,
    state: Mutex<DeviceState>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("slave_id", &self.slave_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        slave_id: u8,
        settings: DeviceSettings,
    ) -> Self {
        let realtime = RealtimeCache::new(settings.realtime_ttl, settings.max_registers_per_read);
        Self {
            name: name.into(),
            address: address.into(),
            slave_id,
            settings,
            rendezvous: None,
            status: RwLock::new(ConnectionStatus::Disconnected),
            state: Mutex::new(DeviceState {
                connector: None,
                transport: None,
                cache: ChannelCache::default(),
                realtime,
                seen_titles: HashMap::new(),
            }),
        }
    }

    /// Allow hardware-address connect strings
    pub fn with_rendezvous(mut self, listener: Arc<RendezvousListener>) -> Self {
        self.rendezvous = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let mut current = self.status.write();
        if *current != status {
            debug!("Device {} status {} -> {}", self.name, *current, status);
            *current = status;
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Obtain a fresh link; no retries here, pacing is the caller's job
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let connector = match &state.connector {
            Some(c) => Arc::clone(c),
            None => {
                let selected =
                    select_connector(&self.address, self.settings.connect_timeout, self.rendezvous.clone())
                        .inspect_err(|_| self.set_status(ConnectionStatus::Disconnected))?;
                let selected: Arc<dyn Connector> = Arc::from(selected);
                state.connector = Some(Arc::clone(&selected));
                selected
            },
        };

        self.set_status(ConnectionStatus::Connecting);
        info!("Connecting device {} via {}", self.name, connector.describe());

        match connector.connect().await {
            Ok(client) => {
                let client = client
                    .with_unit(self.slave_id)
                    .with_response_timeout(self.settings.response_timeout);
                state.invalidate();
                state.transport = Some(Arc::new(ResilientTransport::new(
                    Box::new(client),
                    self.settings.retry.clone(),
                )));
                self.set_status(ConnectionStatus::Connected);
                info!("Device {} connected", self.name);
                Ok(())
            },
            Err(e) => {
                state.teardown();
                self.set_status(ConnectionStatus::Disconnected);
                Err(e.with_context(format!("connect {}", self.name)))
            },
        }
    }

    /// Drop every cached controller object
    pub async fn reset(&self) {
        self.reset_with(|| {}).await;
    }

    /// Reset, running `cleanup` inside the same exclusive section
    pub async fn reset_with<F: FnOnce()>(&self, cleanup: F) {
        let mut state = self.state.lock().await;
        state.invalidate();
        cleanup();
        debug!("Device {} caches reset", self.name);
    }

    /// Reset and release the link
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.teardown();
        self.set_status(ConnectionStatus::Disconnected);
        info!("Device {} closed", self.name);
    }

    async fn lock_connected(&self) -> Result<(MutexGuard<'_, DeviceState>, Arc<ResilientTransport>)> {
        let state = self.state.lock().await;
        let transport = match (&state.transport, self.status()) {
            (Some(t), ConnectionStatus::Connected) => Arc::clone(t),
            _ => return Err(StationError::not_connected(&self.name)),
        };
        Ok((state, transport))
    }

    /// Tear the link down on failures the link cannot recover from
    fn settle<T>(&self, state: &mut DeviceState, op: &str, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            if e.is_link_failure() {
                warn!("Device {} lost its link during {}: {}", self.name, op, e);
                state.teardown();
                self.set_status(ConnectionStatus::Disconnected);
            }
            e.with_context(format!("{} {}", self.name, op))
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn model(&self) -> Result<ModelInfo> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.model(&t).await;
        self.settle(&mut state, "GetModel", result)
    }

    pub async fn network_address(&self) -> Result<NetworkAddress> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.network(&t).await;
        self.settle(&mut state, "GetAddr", result)
    }

    /// Cached count when present, otherwise a fresh read
    pub async fn channel_count(&self) -> Result<ChannelCount> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.counts(&t).await;
        self.settle(&mut state, "GetChannelCount", result)
    }

    pub async fn ai(&self, index: u16) -> Result<AiDescriptor> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.ai(&t, index).await;
        self.settle(&mut state, "GetAI", result)
    }

    pub async fn ao(&self, index: u16) -> Result<AoDescriptor> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.ao(&t, index).await;
        self.settle(&mut state, "GetAO", result)
    }

    pub async fn di(&self, index: u16) -> Result<DiDescriptor> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.di(&t, index).await;
        self.settle(&mut state, "GetDI", result)
    }

    pub async fn do_(&self, index: u16) -> Result<DoDescriptor> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.dout(&t, index).await;
        self.settle(&mut state, "GetDO", result)
    }

    /// One reading per enabled, sampled channel
    pub async fn realtime_snapshot(&self) -> Result<Vec<ChannelReading>> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.collect(&t, false).await;
        self.settle(&mut state, "GetRealTimeData", result)
            .map(|report| report.readings)
    }

    /// Polling-loop entry: snapshot plus discovery bookkeeping
    pub async fn poll_realtime(&self) -> Result<RealtimeReport> {
        let (mut state, t) = self.lock_connected().await?;
        let result = state.collect(&t, true).await;
        self.settle(&mut state, "GetRealTimeData", result)
    }

    pub async fn channel_value(&self, tag: &str) -> Result<ChannelReading> {
        let tag: ChannelTag = tag.parse()?;
        let (mut state, t) = self.lock_connected().await?;
        let result = state.channel_value(&t, tag).await;
        self.settle(&mut state, "GetCHValue", result)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write a digital output; other kinds are read-only
    pub async fn set_channel_value(&self, tag: &str, value: bool) -> Result<()> {
        let tag: ChannelTag = tag.parse()?;
        if tag.kind != ChannelKind::Do {
            return Err(StationError::validation(format!("{tag} is not writable")));
        }
        let (mut state, t) = self.lock_connected().await?;
        let result = state.write_do(&t, tag.index, value).await;
        let result = self.settle(&mut state, "SetCHValue", result);
        if result.is_ok() {
            info!("Device {} {} set to {}", self.name, tag, value);
        }
        result
    }

    pub async fn transport_stats(&self) -> Option<TransportStats> {
        let state = self.state.lock().await;
        state.transport.as_ref().map(|t| t.stats())
    }
}

async fn read_holding(t: &ResilientTransport, address: u16, count: u16) -> Result<Vec<u16>> {
    Ok(t.read_holding_registers(address, count).await?.value)
}

impl DeviceState {
    fn invalidate(&mut self) {
        self.cache = ChannelCache::default();
        self.realtime.invalidate();
    }

    fn teardown(&mut self) {
        self.invalidate();
        self.transport = None;
    }

    async fn model(&mut self, t: &ResilientTransport) -> Result<ModelInfo> {
        if let Some(model) = &self.cache.model {
            return Ok(model.clone());
        }
        let regs = read_holding(t, MODEL_ADDR, MODEL_REGS).await?;
        let model = ModelInfo::from_registers(&regs)?;
        self.cache.model = Some(model.clone());
        Ok(model)
    }

    async fn network(&mut self, t: &ResilientTransport) -> Result<NetworkAddress> {
        if let Some(network) = &self.cache.network {
            return Ok(network.clone());
        }
        let regs = read_holding(t, NETWORK_ADDR, NETWORK_REGS).await?;
        let network = NetworkAddress::from_registers(&regs)?;
        self.cache.network = Some(network.clone());
        Ok(network)
    }

    async fn refresh_counts(&mut self, t: &ResilientTransport) -> Result<ChannelCount> {
        let regs = read_holding(t, CHANNEL_COUNT_ADDR, CHANNEL_COUNT_REGS).await?;
        let counts = ChannelCount::from_registers(&regs)?;
        for kind in [ChannelKind::Ai, ChannelKind::Ao, ChannelKind::Di, ChannelKind::Do] {
            if counts.get(kind) > MAX_CHANNELS_PER_KIND && self.cache.counts != Some(counts) {
                warn!(
                    "Controller reports {} {} channels; only the first {} have descriptors",
                    counts.get(kind),
                    kind,
                    MAX_CHANNELS_PER_KIND
                );
            }
        }
        if self.cache.counts.is_some_and(|old| old != counts) {
            info!("Channel count changed to {:?}", counts.to_registers());
        }
        self.cache.counts = Some(counts);
        Ok(counts)
    }

    async fn counts(&mut self, t: &ResilientTransport) -> Result<ChannelCount> {
        match self.cache.counts {
            Some(counts) => Ok(counts),
            None => self.refresh_counts(t).await,
        }
    }

    /// Bounds-check `tag` and read its header + detail range
    async fn descriptor_regs(&mut self, t: &ResilientTransport, tag: ChannelTag) -> Result<(u16, Vec<u16>)> {
        let base = descriptor_address(tag)?;
        self.counts(t).await?.check(tag)?;
        let len = descriptor_main_regs(tag.kind);
        let regs = read_holding(t, base, len).await?;
        expect_len(tag, &regs, len)?;
        Ok((base, regs))
    }

    async fn ai(&mut self, t: &ResilientTransport, index: u16) -> Result<AiDescriptor> {
        if let Some(desc) = self.cache.ai.get(&index) {
            return Ok(desc.clone());
        }
        let tag = ChannelTag::new(ChannelKind::Ai, index);
        let (base, regs) = self.descriptor_regs(t, tag).await?;
        let mut desc = AiDescriptor::from_registers(index, &regs)?;

        match read_holding(t, base + AI_ALARM_OFFSET, AI_ALARM_REGS).await {
            Ok(regs) => desc.alarm = Some(AlarmConfig::from_registers(&regs)?),
            // Controller refused the range; keep the channel, alarm state reads as Error
            Err(StationError::ProtocolError(e)) => {
                warn!("{} alarm configuration unavailable: {}", tag, e);
            },
            Err(e) => return Err(e),
        }

        debug!("Fetched {} descriptor '{}'", tag, desc.title);
        self.cache.ai.insert(index, desc.clone());
        Ok(desc)
    }

    async fn ao(&mut self, t: &ResilientTransport, index: u16) -> Result<AoDescriptor> {
        if let Some(desc) = self.cache.ao.get(&index) {
            return Ok(desc.clone());
        }
        let tag = ChannelTag::new(ChannelKind::Ao, index);
        let (_, regs) = self.descriptor_regs(t, tag).await?;
        let desc = AoDescriptor::from_registers(index, &regs)?;
        debug!("Fetched {} descriptor '{}'", tag, desc.title);
        self.cache.ao.insert(index, desc.clone());
        Ok(desc)
    }

    async fn di(&mut self, t: &ResilientTransport, index: u16) -> Result<DiDescriptor> {
        if let Some(desc) = self.cache.di.get(&index) {
            return Ok(desc.clone());
        }
        let tag = ChannelTag::new(ChannelKind::Di, index);
        let (_, regs) = self.descriptor_regs(t, tag).await?;
        let desc = DiDescriptor::from_registers(index, &regs)?;
        debug!("Fetched {} descriptor '{}'", tag, desc.title);
        self.cache.di.insert(index, desc.clone());
        Ok(desc)
    }

    async fn dout(&mut self, t: &ResilientTransport, index: u16) -> Result<DoDescriptor> {
        if let Some(desc) = self.cache.dout.get(&index) {
            return Ok(desc.clone());
        }
        let tag = ChannelTag::new(ChannelKind::Do, index);
        let (_, regs) = self.descriptor_regs(t, tag).await?;
        let desc = DoDescriptor::from_registers(index, &regs)?;
        debug!("Fetched {} descriptor '{}'", tag, desc.title);
        self.cache.dout.insert(index, desc.clone());
        Ok(desc)
    }

    /// Count refresh, then image refresh; readers get a private copy
    async fn refresh_realtime(
        &mut self,
        t: &ResilientTransport,
    ) -> Result<(ChannelCount, RealtimeSnapshot, Duration)> {
        let counts = self.refresh_counts(t).await?;
        let elapsed = self.realtime.fetch(t, counts).await?;
        let snapshot = self
            .realtime
            .snapshot()
            .cloned()
            .ok_or_else(|| StationError::data("Real-time image missing after refresh"))?;
        Ok((counts, snapshot, elapsed))
    }

    async fn collect(&mut self, t: &ResilientTransport, discover: bool) -> Result<RealtimeReport> {
        let (counts, snapshot, elapsed) = self.refresh_realtime(t).await?;
        let mut report = RealtimeReport {
            elapsed,
            ..Default::default()
        };

        // Channels past the descriptor map have no title or scaling to report
        let tags: Vec<ChannelTag> = counts
            .tags()
            .filter(|tag| tag.kind == ChannelKind::Vo || has_descriptor(*tag))
            .collect();
        for tag in tags {
            let (enabled, reading) = self.reading(t, tag, &snapshot).await?;
            if !enabled {
                continue;
            }
            if discover && self.seen_titles.get(&tag) != Some(&reading.title) {
                self.seen_titles.insert(tag, reading.title.clone());
                report.discovered.push((tag, reading.title.clone()));
            }
            if reading.value.is_some() {
                report.readings.push(reading);
            }
        }
        Ok(report)
    }

    async fn channel_value(&mut self, t: &ResilientTransport, tag: ChannelTag) -> Result<ChannelReading> {
        let (counts, snapshot, _) = self.refresh_realtime(t).await?;
        counts.check(tag)?;
        let (_, reading) = self.reading(t, tag, &snapshot).await?;
        Ok(reading)
    }

    /// Decode one channel; the flag reports whether the channel is enabled
    async fn reading(
        &mut self,
        t: &ResilientTransport,
        tag: ChannelTag,
        snapshot: &RealtimeSnapshot,
    ) -> Result<(bool, ChannelReading)> {
        let index = tag.index;
        let reading = match tag.kind {
            ChannelKind::Ai => {
                let desc = self.ai(t, index).await?;
                let value = snapshot.ai_value(index, desc.decimal_places);
                let alarm = match value {
                    Some(v) => evaluate(v, desc.alarm.as_ref()),
                    None => AlarmSeverity::Invalid,
                };
                (
                    desc.enabled,
                    ChannelReading {
                        tag,
                        title: desc.title,
                        unit: non_empty(desc.unit),
                        value: value.map(ChannelValue::Analog),
                        alarm: Some(alarm),
                        ctrl: None,
                    },
                )
            },
            ChannelKind::Ao => {
                let desc = self.ao(t, index).await?;
                (
                    desc.enabled,
                    ChannelReading {
                        tag,
                        title: desc.title,
                        unit: non_empty(desc.unit),
                        value: snapshot.ao_value(index).map(ChannelValue::Analog),
                        alarm: None,
                        ctrl: None,
                    },
                )
            },
            ChannelKind::Di => {
                let desc = self.di(t, index).await?;
                (
                    desc.enabled,
                    ChannelReading {
                        tag,
                        title: desc.title,
                        unit: None,
                        value: snapshot.di_value(index).map(ChannelValue::Digital),
                        alarm: None,
                        ctrl: None,
                    },
                )
            },
            ChannelKind::Do => {
                let desc = self.dout(t, index).await?;
                (
                    desc.enabled,
                    ChannelReading {
                        tag,
                        title: desc.title,
                        unit: None,
                        value: snapshot.do_value(index).map(ChannelValue::Digital),
                        alarm: None,
                        ctrl: Some(!desc.auto_control),
                    },
                )
            },
            // Not configurable on the controller
            ChannelKind::Vo => (
                true,
                ChannelReading {
                    tag,
                    title: tag.to_string(),
                    unit: None,
                    value: snapshot.vo_value(index).map(ChannelValue::Analog),
                    alarm: None,
                    ctrl: None,
                },
            ),
        };
        Ok(reading)
    }

    async fn write_do(&mut self, t: &ResilientTransport, index: u16, value: bool) -> Result<()> {
        let counts = self.counts(t).await?;
        counts.check(ChannelTag::new(ChannelKind::Do, index))?;
        t.write_single_coil(index, value).await?;

        if let Some(snapshot) = self.realtime.snapshot_mut() {
            if snapshot.counts() == counts {
                snapshot.set_do_value(index, value);
            }
        }
        if let Some(desc) = self.cache.dout.get_mut(&index) {
            desc.manual_value = value;
        }
        Ok(())
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
