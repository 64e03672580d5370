//! Rendezvous ("meet in the middle") connector
//!
//! Controllers behind NAT dial out to a well-known listener. The accept loop
//! reads the controller's greeting, asks it for its hardware address and
//! parks the attached client until a device with that address claims it.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Connector;
use crate::error::{ErrorExt, Result, StationError};
use crate::protocols::modbus::{ModbusRequest, ModbusResponse, RegisterClient, TcpRegisterClient};
use crate::station::register_map::{MAC_ADDR, MAC_REGS};
use crate::station::MacAddress;

/// Unit id used for the hardware-address query during the handshake
const HANDSHAKE_UNIT_ID: u8 = 1;
const GREETING_MAX_LEN: usize = 64;
/// Quiet gap that ends a greeting sent in several segments
const GREETING_IDLE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RendezvousSettings {
    /// How long to wait for the optional greeting before querying anyway
    pub greeting_timeout: Duration,
    /// Bound on the whole handshake, greeting included
    pub handshake_timeout: Duration,
}

impl Default for RendezvousSettings {
    fn default() -> Self {
        Self {
            greeting_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Background accept loop plus the table of parked connections
#[derive(Debug)]
pub struct RendezvousListener {
    local_addr: SocketAddr,
    /// The mutex only makes the parked client shareable
    pending: DashMap<MacAddress, Mutex<TcpRegisterClient>>,
}

impl RendezvousListener {
    /// Bind and spawn the accept loop; it runs until `cancel` fires
    pub async fn start(
        bind: &str,
        settings: RendezvousSettings,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(bind)
            .await
            .config_error(&format!("Failed to bind rendezvous listener on {bind}"))?;
        let local_addr = listener.local_addr()?;
        info!("Rendezvous listener on {}", local_addr);

        let this = Arc::new(Self {
            local_addr,
            pending: DashMap::new(),
        });
        tokio::spawn(accept_loop(listener, Arc::clone(&this), settings, cancel));
        Ok(this)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remove and return the parked connection for `mac`
    pub fn try_take(&self, mac: &MacAddress) -> Result<TcpRegisterClient> {
        self.pending
            .remove(mac)
            .map(|(_, client)| client.into_inner())
            .ok_or_else(|| StationError::not_found(format!("No pending connection from {mac}")))
    }

    pub fn pending(&self) -> Vec<MacAddress> {
        self.pending.iter().map(|e| *e.key()).collect()
    }

    fn park(&self, mac: MacAddress, client: TcpRegisterClient) {
        if self.pending.insert(mac, Mutex::new(client)).is_some() {
            debug!("Replaced stale pending connection from {}", mac);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<RendezvousListener>,
    settings: RendezvousSettings,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Rendezvous listener stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&registry);
                        let settings = settings.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = handshake(stream, peer, &settings) => match result {
                                    Ok((mac, client)) => {
                                        info!("Controller {} checked in from {}", mac, peer);
                                        registry.park(mac, client);
                                    },
                                    Err(e) => warn!("Rendezvous handshake with {} failed: {}", peer, e),
                                },
                            }
                        });
                    },
                    Err(e) => {
                        error!("Rendezvous accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    },
                }
            }
        }
    }
}

/// Collect the optional greeting until the controller goes quiet
///
/// The first segment may take up to `first_wait`; later segments must follow
/// within [`GREETING_IDLE`]. Reading stops at [`GREETING_MAX_LEN`] bytes.
async fn read_greeting<R>(stream: &mut R, first_wait: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut greeting = Vec::new();
    let mut buf = [0u8; GREETING_MAX_LEN];
    let mut wait = first_wait;
    while greeting.len() < GREETING_MAX_LEN {
        let room = GREETING_MAX_LEN - greeting.len();
        match timeout(wait, stream.read(&mut buf[..room])).await {
            Ok(Ok(0)) => {
                return Err(StationError::connection("Peer closed before the handshake"))
            },
            Ok(Ok(n)) => {
                greeting.extend_from_slice(&buf[..n]);
                wait = GREETING_IDLE;
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }
    Ok(greeting)
}

/// Read the greeting, then query the hardware address
async fn handshake(
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: &RendezvousSettings,
) -> Result<(MacAddress, TcpRegisterClient)> {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on {}: {}", peer, e);
    }
    timeout(settings.handshake_timeout, async {
        let greeting = read_greeting(&mut stream, settings.greeting_timeout)
            .await
            .map_err(|e| e.with_context(peer))?;
        if greeting.is_empty() {
            debug!("No greeting from {}, querying directly", peer);
        } else {
            debug!("Greeting from {}: {:?}", peer, String::from_utf8_lossy(&greeting));
        }

        let mut client = TcpRegisterClient::attach(stream, peer.to_string())
            .with_unit(HANDSHAKE_UNIT_ID)
            .with_response_timeout(settings.handshake_timeout);
        let response = client
            .execute(ModbusRequest::ReadHoldingRegisters {
                address: MAC_ADDR,
                count: MAC_REGS,
            })
            .await?;
        let mac = match response {
            ModbusResponse::Registers(regs) => MacAddress::from_registers(&regs)?,
            other => {
                return Err(StationError::protocol(format!(
                    "Unexpected handshake response {other:?}"
                )))
            },
        };
        Ok((mac, client))
    })
    .await
    .map_err(|_| StationError::timeout(format!("Handshake with {peer} timed out")))?
}

/// Claims the parked link for one hardware address
#[derive(Debug, Clone)]
pub struct RendezvousConnector {
    listener: Arc<RendezvousListener>,
    mac: MacAddress,
}

impl RendezvousConnector {
    pub fn new(listener: Arc<RendezvousListener>, mac: MacAddress) -> Self {
        Self { listener, mac }
    }
}

#[async_trait]
impl Connector for RendezvousConnector {
    async fn connect(&self) -> Result<TcpRegisterClient> {
        self.listener.try_take(&self.mac)
    }

    fn describe(&self) -> String {
        format!("rendezvous://{}", self.mac)
    }
}
