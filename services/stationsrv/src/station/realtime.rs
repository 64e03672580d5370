//! Real-time data cache
//!
//! Bulk-reads the flat value image (one 4-byte slot per channel, in AI, DI,
//! DO, AO, VO order) plus one readiness byte per channel. A slot is only
//! decoded when its readiness byte is [`READY`]; otherwise the accessors
//! report `None`.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::channel::{ChannelCount, ChannelKind, ChannelTag};
use super::register_map::{READY, REALTIME_DATA_ADDR, REALTIME_STATE_ADDR};
use crate::codec::{encode_swapped_float, registers_to_bytes, scale_to_decimal_places, swapped_float_at};
use crate::error::{Result, StationError};
use crate::protocols::modbus::ResilientTransport;

const SLOT_BYTES: usize = 4;

/// One decoded image, built against a specific channel count
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeSnapshot {
    counts: ChannelCount,
    data: Vec<u8>,
    readiness: Vec<u8>,
}

impl RealtimeSnapshot {
    pub fn new(counts: ChannelCount, data: Vec<u8>, readiness: Vec<u8>) -> Self {
        Self {
            counts,
            data,
            readiness,
        }
    }

    pub fn counts(&self) -> ChannelCount {
        self.counts
    }

    /// Raw 4-byte slot for a flat index, `None` when not ready or not present
    fn slot(&self, flat: usize) -> Option<[u8; 4]> {
        if SLOT_BYTES * flat + SLOT_BYTES > self.data.len() {
            return None;
        }
        if self.readiness.get(flat).copied() != Some(READY) {
            return None;
        }
        let s = &self.data[SLOT_BYTES * flat..SLOT_BYTES * flat + SLOT_BYTES];
        Some([s[0], s[1], s[2], s[3]])
    }

    fn slot_for(&self, kind: ChannelKind, index: u16) -> Option<[u8; 4]> {
        let flat = self.counts.flat_index(ChannelTag::new(kind, index))?;
        self.slot(flat)
    }

    fn float(&self, kind: ChannelKind, index: u16) -> Option<f32> {
        self.slot_for(kind, index)
            .and_then(|s| swapped_float_at(&s, 0).ok())
    }

    /// Digital slots are true when any byte is non-zero
    fn digital(&self, kind: ChannelKind, index: u16) -> Option<bool> {
        self.slot_for(kind, index).map(|s| s.iter().any(|&b| b != 0))
    }

    pub fn ai_value(&self, index: u16, decimal_places: u16) -> Option<f32> {
        self.float(ChannelKind::Ai, index)
            .map(|v| scale_to_decimal_places(v, u32::from(decimal_places)))
    }

    pub fn di_value(&self, index: u16) -> Option<bool> {
        self.digital(ChannelKind::Di, index)
    }

    pub fn do_value(&self, index: u16) -> Option<bool> {
        self.digital(ChannelKind::Do, index)
    }

    pub fn ao_value(&self, index: u16) -> Option<f32> {
        self.float(ChannelKind::Ao, index)
    }

    pub fn vo_value(&self, index: u16) -> Option<f32> {
        self.float(ChannelKind::Vo, index)
    }

    /// Reflect a coil write locally until the next refresh
    pub fn set_do_value(&mut self, index: u16, value: bool) {
        let Some(flat) = self.counts.flat_index(ChannelTag::new(ChannelKind::Do, index)) else {
            return;
        };
        let end = SLOT_BYTES * flat + SLOT_BYTES;
        if end > self.data.len() || flat >= self.readiness.len() {
            return;
        }
        let encoded = encode_swapped_float(if value { 1.0 } else { 0.0 });
        self.data[SLOT_BYTES * flat..end].copy_from_slice(&encoded);
        self.readiness[flat] = READY;
    }
}

/// TTL-bounded cache of the latest snapshot
#[derive(Debug)]
pub struct RealtimeCache {
    ttl: Duration,
    max_registers_per_read: u16,
    snapshot: Option<RealtimeSnapshot>,
    fetched_at: Option<Instant>,
}

impl RealtimeCache {
    pub fn new(ttl: Duration, max_registers_per_read: u16) -> Self {
        Self {
            ttl,
            max_registers_per_read: max_registers_per_read.max(1),
            snapshot: None,
            fetched_at: None,
        }
    }

    /// Fresh when younger than the TTL and built against the same counts
    pub fn is_fresh(&self, counts: &ChannelCount) -> bool {
        match (&self.snapshot, self.fetched_at) {
            (Some(snap), Some(at)) => snap.counts == *counts && at.elapsed() < self.ttl,
            _ => false,
        }
    }

    pub fn invalidate(&mut self) {
        self.snapshot = None;
        self.fetched_at = None;
    }

    pub fn snapshot(&self) -> Option<&RealtimeSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_mut(&mut self) -> Option<&mut RealtimeSnapshot> {
        self.snapshot.as_mut()
    }

    /// Refresh from the controller unless fresh; returns accumulated read time
    pub async fn fetch(&mut self, transport: &ResilientTransport, counts: ChannelCount) -> Result<Duration> {
        if self.is_fresh(&counts) {
            return Ok(Duration::ZERO);
        }
        if self.snapshot.as_ref().is_some_and(|s| s.counts != counts) {
            debug!("Channel count changed, dropping real-time image");
            self.invalidate();
        }

        let channels = counts.total();
        let words = channels * 2;
        if words > usize::from(REALTIME_STATE_ADDR - REALTIME_DATA_ADDR)
            || channels > usize::from(u16::MAX - REALTIME_STATE_ADDR) + 1
        {
            return Err(StationError::data(format!(
                "{channels} channels do not fit the real-time image"
            )));
        }

        let mut elapsed = Duration::ZERO;

        let mut data = Vec::with_capacity(words * 2);
        for regs in self
            .read_chunked(transport, REALTIME_DATA_ADDR, words, &mut elapsed)
            .await?
        {
            data.extend(registers_to_bytes(&regs));
        }

        let mut readiness = Vec::with_capacity(channels);
        for regs in self
            .read_chunked(transport, REALTIME_STATE_ADDR, channels, &mut elapsed)
            .await?
        {
            readiness.extend(regs.iter().map(|r| (r & 0xFF) as u8));
        }

        debug!(
            "Real-time image refreshed: {} channels, {} bytes in {:?}",
            channels,
            data.len(),
            elapsed
        );
        self.snapshot = Some(RealtimeSnapshot::new(counts, data, readiness));
        self.fetched_at = Some(Instant::now());
        Ok(elapsed)
    }

    /// Successive input-register reads of at most `max_registers_per_read`
    async fn read_chunked(
        &self,
        transport: &ResilientTransport,
        base: u16,
        total: usize,
        elapsed: &mut Duration,
    ) -> Result<Vec<Vec<u16>>> {
        let mut chunks = Vec::new();
        let mut done = 0usize;
        while done < total {
            let count = (total - done).min(usize::from(self.max_registers_per_read)) as u16;
            let address = base + done as u16;
            let timed = transport.read_input_registers(address, count).await?;
            *elapsed += timed.elapsed;
            done += count as usize;
            chunks.push(timed.value);
        }
        Ok(chunks)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::codec::encode_swapped_float;
    use crate::protocols::modbus::{
        ModbusRequest, ModbusResponse, RegisterClient, RetryPolicy,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Answers every register read with zeros and records the request
    struct RecordingClient {
        requests: Arc<Mutex<Vec<ModbusRequest>>>,
    }

    #[async_trait]
    impl RegisterClient for RecordingClient {
        async fn execute(&mut self, request: ModbusRequest) -> crate::error::Result<ModbusResponse> {
            self.requests.lock().push(request);
            match request {
                ModbusRequest::ReadInputRegisters { count, .. } => {
                    Ok(ModbusResponse::Registers(vec![0; count as usize]))
                },
                _ => Err(StationError::protocol("unexpected request")),
            }
        }
    }

    fn recording() -> (ResilientTransport, Arc<Mutex<Vec<ModbusRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let client = RecordingClient {
            requests: requests.clone(),
        };
        (
            ResilientTransport::new(Box::new(client), RetryPolicy::default()),
            requests,
        )
    }

    fn snapshot_with(counts: ChannelCount, slots: &[(f32, u8)]) -> RealtimeSnapshot {
        let mut data = Vec::new();
        let mut readiness = Vec::new();
        for &(v, ready) in slots {
            data.extend(encode_swapped_float(v));
            readiness.push(ready);
        }
        RealtimeSnapshot::new(counts, data, readiness)
    }

    #[tokio::test]
    async fn test_data_phase_chunking() {
        let (transport, requests) = recording();
        let mut cache = RealtimeCache::new(Duration::from_secs(1), 124);
        // 300 channels → 600 words
        let counts = ChannelCount::new(100, 100, 50, 30, 20);

        cache.fetch(&transport, counts).await.unwrap();

        let requests = requests.lock();
        let data_sizes: Vec<u16> = requests
            .iter()
            .filter_map(|r| match *r {
                ModbusRequest::ReadInputRegisters { address, count } if address < REALTIME_STATE_ADDR => {
                    Some(count)
                },
                _ => None,
            })
            .collect();
        assert_eq!(data_sizes, vec![124, 124, 124, 124, 104]);

        let state: Vec<(u16, u16)> = requests
            .iter()
            .filter_map(|r| match *r {
                ModbusRequest::ReadInputRegisters { address, count } if address >= REALTIME_STATE_ADDR => {
                    Some((address, count))
                },
                _ => None,
            })
            .collect();
        assert_eq!(
            state,
            vec![(0x4000, 124), (0x4000 + 124, 124), (0x4000 + 248, 52)]
        );

        let snap = cache.snapshot().unwrap();
        assert_eq!(snap.data.len(), 600 * 2);
        assert_eq!(snap.readiness.len(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_and_count_change() {
        let (transport, requests) = recording();
        let mut cache = RealtimeCache::new(Duration::from_secs(1), 124);
        let counts = ChannelCount::new(2, 0, 0, 0, 0);

        cache.fetch(&transport, counts).await.unwrap();
        assert_eq!(requests.lock().len(), 2);

        // Within TTL: no I/O
        cache.fetch(&transport, counts).await.unwrap();
        assert_eq!(requests.lock().len(), 2);

        // Different counts force a refresh even within TTL
        cache
            .fetch(&transport, ChannelCount::new(3, 0, 0, 0, 0))
            .await
            .unwrap();
        assert_eq!(requests.lock().len(), 4);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(!cache.is_fresh(&ChannelCount::new(3, 0, 0, 0, 0)));
    }

    #[test]
    fn test_readiness_gates_values() {
        let counts = ChannelCount::new(2, 1, 1, 1, 1);
        let snap = snapshot_with(
            counts,
            &[
                (12.345, READY), // AI-0
                (99.0, 1),       // AI-1 not sampled
                (1.0, READY),    // DI-0
                (0.0, READY),    // DO-0
                (42.5, 0x7F),    // AO-0 sensor fault
                (7.0, READY),    // VO-0
            ],
        );

        assert!((snap.ai_value(0, 2).unwrap() - 12.34).abs() < 1e-4);
        assert_eq!(snap.ai_value(1, 2), None);
        assert_eq!(snap.di_value(0), Some(true));
        assert_eq!(snap.do_value(0), Some(false));
        assert_eq!(snap.ao_value(0), None);
        assert_eq!(snap.vo_value(0), Some(7.0));
        // Beyond the count
        assert_eq!(snap.ai_value(2, 0), None);
    }

    #[test]
    fn test_short_buffer_reports_not_ready() {
        let counts = ChannelCount::new(3, 0, 0, 0, 0);
        // Only two slots came back
        let snap = snapshot_with(counts, &[(1.0, READY), (2.0, READY)]);
        assert_eq!(snap.ai_value(1, 0), Some(2.0));
        assert_eq!(snap.ai_value(2, 0), None);
    }

    #[test]
    fn test_set_do_value_overrides_locally() {
        let counts = ChannelCount::new(0, 0, 2, 0, 0);
        let mut snap = snapshot_with(counts, &[(0.0, READY), (0.0, 3)]);
        snap.set_do_value(1, true);
        assert_eq!(snap.do_value(1), Some(true));
        snap.set_do_value(0, true);
        snap.set_do_value(0, false);
        assert_eq!(snap.do_value(0), Some(false));
        // Out of range is ignored
        snap.set_do_value(5, true);
    }

    #[test]
    fn test_clone_is_independent() {
        let counts = ChannelCount::new(0, 0, 1, 0, 0);
        let mut live = snapshot_with(counts, &[(0.0, READY)]);
        let reader = live.clone();
        live.set_do_value(0, true);
        assert_eq!(reader.do_value(0), Some(false));
        assert_eq!(live.do_value(0), Some(true));
    }
}
