//! In-memory controller simulator
//!
//! A tokio-modbus TCP server backed by register maps, laid out like a real
//! station controller. Used by the integration tests and for local development
//! without hardware. Unset registers read as zero.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::{self, Future};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::server::tcp::Server;
use tokio_modbus::{ExceptionCode, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{bytes_to_registers, encode_swapped_float};
use crate::error::{Result, StationError};
use crate::protocols::modbus::ModbusRequest;
use crate::station::register_map::{
    descriptor_address, AI_ALARM_OFFSET, CHANNEL_COUNT_ADDR, MODEL_ADDR, NETWORK_ADDR, READY,
    REALTIME_DATA_ADDR, REALTIME_STATE_ADDR,
};
use crate::station::{
    AiDescriptor, AoDescriptor, ChannelCount, ChannelKind, ChannelTag, DiDescriptor,
    DoDescriptor, ModelInfo, NetworkAddress,
};

/// Simulated station controller
#[derive(Debug, Default)]
pub struct SimulatedStation {
    holding: RwLock<HashMap<u16, u16>>,
    input: RwLock<HashMap<u16, u16>>,
    coils: RwLock<HashMap<u16, bool>>,
    discrete: RwLock<HashMap<u16, bool>>,
    /// Holding addresses that answer with an illegal-address exception
    denied: RwLock<HashSet<u16>>,
    counts: RwLock<Option<ChannelCount>>,
    busy_replies: AtomicU32,
    delayed_replies: AtomicU32,
    reply_delay: Mutex<Duration>,
    silent: AtomicBool,
    requests: Mutex<Vec<ModbusRequest>>,
}

impl SimulatedStation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ------------------------------------------------------------------
    // Raw register access
    // ------------------------------------------------------------------

    pub fn set_holding(&self, address: u16, values: &[u16]) {
        let mut map = self.holding.write();
        for (addr, v) in (address..).zip(values) {
            map.insert(addr, *v);
        }
    }

    pub fn set_input(&self, address: u16, values: &[u16]) {
        let mut map = self.input.write();
        for (addr, v) in (address..).zip(values) {
            map.insert(addr, *v);
        }
    }

    pub fn set_discrete(&self, address: u16, value: bool) {
        self.discrete.write().insert(address, value);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.coils.read().get(&address).copied().unwrap_or(false)
    }

    /// Reads touching any of these holding registers fail with exception 2
    pub fn deny_holding(&self, address: u16, count: u16) {
        self.denied.write().extend(address..address.saturating_add(count));
    }

    /// Answer the next `n` requests with "server busy"
    pub fn inject_busy(&self, n: u32) {
        self.busy_replies.store(n, Ordering::SeqCst);
    }

    /// Hold each of the next `n` replies back for `delay`
    pub fn inject_delay(&self, n: u32, delay: Duration) {
        *self.reply_delay.lock() = delay;
        self.delayed_replies.store(n, Ordering::SeqCst);
    }

    /// Delay owed to the reply being produced, if any
    fn take_delay(&self) -> Option<Duration> {
        self.delayed_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| *self.reply_delay.lock())
    }

    /// Stop answering requests while keeping connections open
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ModbusRequest> {
        self.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    // ------------------------------------------------------------------
    // Register-map installers
    // ------------------------------------------------------------------

    pub fn install_model(&self, model: &ModelInfo) {
        self.set_holding(MODEL_ADDR, &model.to_registers());
    }

    pub fn install_network(&self, network: &NetworkAddress) {
        self.set_holding(NETWORK_ADDR, &network.to_registers());
    }

    pub fn install_counts(&self, counts: ChannelCount) {
        self.set_holding(CHANNEL_COUNT_ADDR, &counts.to_registers());
        *self.counts.write() = Some(counts);
    }

    pub fn install_ai(&self, desc: &AiDescriptor) -> Result<()> {
        let base = descriptor_address(desc.tag())?;
        self.set_holding(base, &desc.to_registers());
        if let Some(alarm) = &desc.alarm {
            self.set_holding(base + AI_ALARM_OFFSET, &alarm.to_registers());
        }
        Ok(())
    }

    pub fn install_ao(&self, desc: &AoDescriptor) -> Result<()> {
        self.set_holding(descriptor_address(desc.tag())?, &desc.to_registers());
        Ok(())
    }

    pub fn install_di(&self, desc: &DiDescriptor) -> Result<()> {
        self.set_holding(descriptor_address(desc.tag())?, &desc.to_registers());
        Ok(())
    }

    pub fn install_do(&self, desc: &DoDescriptor) -> Result<()> {
        self.set_holding(descriptor_address(desc.tag())?, &desc.to_registers());
        Ok(())
    }

    /// Write one real-time slot; needs [`Self::install_counts`] first
    pub fn set_slot(&self, tag: ChannelTag, bytes: [u8; 4], readiness: u8) -> Result<()> {
        let counts = (*self.counts.read())
            .ok_or_else(|| StationError::config("install_counts before set_slot"))?;
        let flat = counts
            .flat_index(tag)
            .ok_or_else(|| StationError::channel_out_of_range(tag, counts.get(tag.kind)))?;
        let flat = u16::try_from(flat).map_err(|_| StationError::validation("slot overflow"))?;
        self.set_input(REALTIME_DATA_ADDR + 2 * flat, &bytes_to_registers(&bytes));
        self.set_input(REALTIME_STATE_ADDR + flat, &[u16::from(readiness)]);
        Ok(())
    }

    pub fn set_analog(&self, tag: ChannelTag, value: f32) -> Result<()> {
        self.set_slot(tag, encode_swapped_float(value), READY)
    }

    pub fn set_digital(&self, tag: ChannelTag, value: bool) -> Result<()> {
        self.set_slot(tag, encode_swapped_float(if value { 1.0 } else { 0.0 }), READY)
    }

    /// Mark a slot as not sampled
    pub fn set_not_ready(&self, tag: ChannelTag, readiness: u8) -> Result<()> {
        self.set_slot(tag, [0; 4], readiness)
    }

    // ------------------------------------------------------------------
    // Request handling
    // ------------------------------------------------------------------

    /// Reply to one request; `None` while silent
    fn respond(&self, request: &Request<'_>) -> Option<std::result::Result<Response, ExceptionCode>> {
        if self.silent.load(Ordering::SeqCst) {
            return None;
        }
        if self
            .busy_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Some(Err(ExceptionCode::ServerDeviceBusy));
        }

        let Some(parsed) = ModbusRequest::from_request(request) else {
            debug!("Simulator rejected unsupported request {:?}", request);
            return Some(Err(ExceptionCode::IllegalFunction));
        };
        if let Err(e) = parsed.validate() {
            debug!("Simulator rejected request: {}", e);
            return Some(Err(ExceptionCode::IllegalDataValue));
        }
        self.requests.lock().push(parsed);
        Some(self.apply(parsed))
    }

    fn apply(&self, request: ModbusRequest) -> std::result::Result<Response, ExceptionCode> {
        match request {
            ModbusRequest::ReadCoils { address, count } => {
                read_range(&self.coils.read(), address, count).map(Response::ReadCoils)
            },
            ModbusRequest::ReadDiscreteInputs { address, count } => {
                read_range(&self.discrete.read(), address, count).map(Response::ReadDiscreteInputs)
            },
            ModbusRequest::ReadHoldingRegisters { address, count } => {
                {
                    let denied = self.denied.read();
                    if (address..address.saturating_add(count)).any(|a| denied.contains(&a)) {
                        return Err(ExceptionCode::IllegalDataAddress);
                    }
                }
                read_range(&self.holding.read(), address, count).map(Response::ReadHoldingRegisters)
            },
            ModbusRequest::ReadInputRegisters { address, count } => {
                read_range(&self.input.read(), address, count).map(Response::ReadInputRegisters)
            },
            ModbusRequest::WriteSingleCoil { address, value } => {
                self.coils.write().insert(address, value);
                // The controller mirrors DO coils into the real-time image
                let counts = *self.counts.read();
                if let Some(counts) = counts {
                    if address < counts.get(ChannelKind::Do) {
                        let tag = ChannelTag::new(ChannelKind::Do, address);
                        if let Err(e) = self.set_digital(tag, value) {
                            warn!("Simulator could not mirror {}: {}", tag, e);
                        }
                    }
                }
                Ok(Response::WriteSingleCoil(address, value))
            },
        }
    }
}

fn read_range<T: Copy + Default>(
    map: &HashMap<u16, T>,
    address: u16,
    count: u16,
) -> std::result::Result<Vec<T>, ExceptionCode> {
    if u32::from(address) + u32::from(count) > 0x1_0000 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok((0..count)
        .map(|i| map.get(&(address + i)).copied().unwrap_or_default())
        .collect())
}

type Reply = Pin<Box<dyn Future<Output = std::result::Result<Response, ExceptionCode>> + Send>>;

/// tokio-modbus service answering from one station
#[derive(Debug, Clone)]
struct StationHandler {
    station: Arc<SimulatedStation>,
    cancel: CancellationToken,
}

impl tokio_modbus::server::Service for StationHandler {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Reply;

    fn call(&self, req: Self::Request) -> Self::Future {
        match self.station.respond(&req) {
            Some(reply) => match self.station.take_delay() {
                Some(delay) => Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    reply
                }),
                None => Box::pin(future::ready(reply)),
            },
            // Silent: hold the reply until the simulator stops
            None => {
                let cancel = self.cancel.clone();
                Box::pin(async move {
                    cancel.cancelled().await;
                    Err(ExceptionCode::ServerDeviceFailure)
                })
            },
        }
    }
}

const PIPE_BUFFER: usize = 4096;

/// Copy both ways until either side closes or `cancel` fires
async fn pipe<A, B>(mut a: A, mut b: B, cancel: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut a, &mut b) => {
            if let Err(e) = result {
                debug!("Simulator connection closed: {}", e);
            }
        }
    }
}

/// Listen on `bind` and serve every connection until `cancel` fires
///
/// Accepted sockets reach the Modbus server through a pipe, so cancelling
/// also drops connections that are already open.
pub async fn serve(
    station: Arc<SimulatedStation>,
    bind: &str,
    cancel: CancellationToken,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    info!("Controller simulator listening on {}", local_addr);

    let handler = StationHandler {
        station,
        cancel: cancel.clone(),
    };
    let server = Server::new(listener);
    tokio::spawn(async move {
        let on_connected = move |stream: TcpStream, peer: SocketAddr| {
            let handler = handler.clone();
            async move {
                debug!("Simulator accepted {}", peer);
                let (outer, inner) = tokio::io::duplex(PIPE_BUFFER);
                tokio::spawn(pipe(stream, outer, handler.cancel.clone()));
                Ok::<_, std::io::Error>(Some((handler, inner)))
            }
        };
        let on_process_error = |err: std::io::Error| debug!("Simulator connection error: {}", err);

        tokio::select! {
            _ = cancel.cancelled() => debug!("Simulator on {} stopping", local_addr),
            result = server.serve(&on_connected, on_process_error) => {
                if let Err(e) = result {
                    warn!("Simulator on {} stopped: {}", local_addr, e);
                }
            }
        }
    });
    Ok(local_addr)
}

/// Dial a rendezvous listener like a controller behind NAT, then serve requests
pub async fn dial_rendezvous(
    station: Arc<SimulatedStation>,
    listener: SocketAddr,
    greeting: Option<&[u8]>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut outbound = TcpStream::connect(listener).await?;
    if let Some(greeting) = greeting {
        outbound.write_all(greeting).await?;
        outbound.flush().await?;
    }
    // Requests arriving on the outbound link are answered by a private server
    let local = serve(station, "127.0.0.1:0", cancel.clone()).await?;
    let inbound = TcpStream::connect(local).await?;
    tokio::spawn(pipe(outbound, inbound, cancel));
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::modbus::{ModbusResponse, RegisterClient, TcpRegisterClient};

    #[test]
    fn test_register_reads() {
        let sim = SimulatedStation::new();
        sim.set_holding(64, &[4, 2, 1, 1, 0]);
        assert_eq!(
            sim.respond(&Request::ReadHoldingRegisters(64, 5)),
            Some(Ok(Response::ReadHoldingRegisters(vec![4, 2, 1, 1, 0])))
        );
    }

    #[test]
    fn test_exceptions() {
        let sim = SimulatedStation::new();
        assert_eq!(
            sim.respond(&Request::WriteSingleRegister(0, 1)),
            Some(Err(ExceptionCode::IllegalFunction))
        );
        assert_eq!(
            sim.respond(&Request::ReadHoldingRegisters(0, 0)),
            Some(Err(ExceptionCode::IllegalDataValue))
        );
        assert_eq!(
            sim.respond(&Request::ReadInputRegisters(0xFFF0, 0x20)),
            Some(Err(ExceptionCode::IllegalDataAddress))
        );

        sim.deny_holding(0x1040, 22);
        assert_eq!(
            sim.respond(&Request::ReadHoldingRegisters(0x1040, 22)),
            Some(Err(ExceptionCode::IllegalDataAddress))
        );
    }

    #[test]
    fn test_busy_injection_and_silence() {
        let sim = SimulatedStation::new();
        sim.inject_busy(2);
        let read = Request::ReadInputRegisters(0, 1);
        assert_eq!(sim.respond(&read), Some(Err(ExceptionCode::ServerDeviceBusy)));
        assert_eq!(sim.respond(&read), Some(Err(ExceptionCode::ServerDeviceBusy)));
        assert_eq!(
            sim.respond(&read),
            Some(Ok(Response::ReadInputRegisters(vec![0])))
        );

        sim.set_silent(true);
        assert!(sim.respond(&read).is_none());
    }

    #[test]
    fn test_coil_write_mirrors_realtime_slot() {
        let sim = SimulatedStation::new();
        sim.install_counts(ChannelCount::new(1, 0, 2, 0, 0));
        assert_eq!(
            sim.respond(&Request::WriteSingleCoil(1, true)),
            Some(Ok(Response::WriteSingleCoil(1, true)))
        );
        assert!(sim.coil(1));

        // DO-1 is flat index 2 → data registers 4 and 5
        let expected = bytes_to_registers(&encode_swapped_float(1.0));
        assert_eq!(
            sim.respond(&Request::ReadInputRegisters(4, 2)),
            Some(Ok(Response::ReadInputRegisters(expected)))
        );
        assert_eq!(sim.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_drops_open_connections() {
        let sim = SimulatedStation::new();
        sim.set_input(0, &[42]);
        let cancel = CancellationToken::new();
        let addr = serve(Arc::clone(&sim), "127.0.0.1:0", cancel.clone())
            .await
            .unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = TcpRegisterClient::attach(stream, addr.to_string());

        let read = ModbusRequest::ReadInputRegisters {
            address: 0,
            count: 1,
        };
        assert_eq!(
            client.execute(read).await.unwrap(),
            ModbusResponse::Registers(vec![42])
        );

        cancel.cancel();
        let err = client.execute(read).await.unwrap_err();
        assert!(err.is_link_failure(), "{err}");
    }
}
