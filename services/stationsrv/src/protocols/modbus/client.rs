//! Register client trait and the Modbus TCP implementation
//!
//! Framing, transaction ids and exception decoding come from tokio-modbus.
//! The client attaches to any byte stream, so the same request path runs on a
//! dialed socket, a socket handed over by the rendezvous listener, or an
//! in-memory duplex in tests.
//!
//! A request that times out keeps its call in flight. The next request first
//! waits for that reply and drops it, so a late frame is never read as the
//! answer to a newer request.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout_at, Instant};
use tokio_modbus::client::{tcp, Client, Context};
use tokio_modbus::prelude::SlaveContext;
use tokio_modbus::{Response, Slave};
use tracing::{debug, trace};

use super::request::{exception_error, ModbusRequest, ModbusResponse};
use crate::error::{Result, StationError};

pub const DEFAULT_UNIT_ID: u8 = 1;
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One request, one response, no retries
#[async_trait]
pub trait RegisterClient: Send {
    async fn execute(&mut self, request: ModbusRequest) -> Result<ModbusResponse>;
}

type InFlight = Pin<Box<dyn Future<Output = (Context, tokio_modbus::Result<Response>)> + Send>>;

enum Link {
    Idle(Context),
    /// A timed-out call whose reply may still arrive
    AwaitingReply(InFlight),
    Closed,
}

/// Modbus TCP client over any duplex stream
pub struct TcpRegisterClient {
    link: Link,
    unit_id: u8,
    response_timeout: Duration,
    peer: String,
}

impl fmt::Debug for TcpRegisterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = match self.link {
            Link::Idle(_) => "idle",
            Link::AwaitingReply(_) => "awaiting-reply",
            Link::Closed => "closed",
        };
        f.debug_struct("TcpRegisterClient")
            .field("peer", &self.peer)
            .field("unit_id", &self.unit_id)
            .field("link", &link)
            .finish()
    }
}

impl TcpRegisterClient {
    pub fn attach<T>(transport: T, peer: impl Into<String>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug + 'static,
    {
        Self {
            link: Link::Idle(tcp::attach_slave(transport, Slave(DEFAULT_UNIT_ID))),
            unit_id: DEFAULT_UNIT_ID,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            peer: peer.into(),
        }
    }

    pub fn with_unit(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Label used in log lines and error messages
    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn timed_out(&self) -> StationError {
        StationError::timeout(format!(
            "No response from {} within {:?}",
            self.peer, self.response_timeout
        ))
    }

    /// Context ready for a new request, after draining any owed reply
    async fn ready_context(&mut self, deadline: Instant) -> Result<Context> {
        match std::mem::replace(&mut self.link, Link::Closed) {
            Link::Idle(ctx) => Ok(ctx),
            Link::AwaitingReply(mut call) => match timeout_at(deadline, &mut call).await {
                Ok((ctx, Ok(_))) => {
                    debug!("Dropped late reply from {}", self.peer);
                    Ok(ctx)
                },
                Ok((_, Err(e))) => Err(link_error(&self.peer, e)),
                Err(_) => {
                    self.link = Link::AwaitingReply(call);
                    Err(self.timed_out())
                },
            },
            Link::Closed => Err(StationError::connection(format!(
                "Link to {} is closed",
                self.peer
            ))),
        }
    }
}

/// Transport and framing failures leave the stream unusable
fn link_error(peer: &str, err: tokio_modbus::Error) -> StationError {
    match err {
        tokio_modbus::Error::Transport(e) => StationError::from(e).with_context(peer),
        other => StationError::connection(format!("{peer}: {other}")),
    }
}

#[async_trait]
impl RegisterClient for TcpRegisterClient {
    async fn execute(&mut self, request: ModbusRequest) -> Result<ModbusResponse> {
        request.validate()?;
        let deadline = Instant::now() + self.response_timeout;
        let mut ctx = self.ready_context(deadline).await?;
        ctx.set_slave(Slave(self.unit_id));
        trace!("{:?} -> {} (unit {})", request, self.peer, self.unit_id);

        let mut call: InFlight = Box::pin(async move {
            let result = ctx.call(request.to_request()).await;
            (ctx, result)
        });
        match timeout_at(deadline, &mut call).await {
            Ok((ctx, Ok(Ok(response)))) => {
                self.link = Link::Idle(ctx);
                ModbusResponse::from_response(&request, response)
            },
            Ok((ctx, Ok(Err(code)))) => {
                self.link = Link::Idle(ctx);
                Err(exception_error(&request, code))
            },
            Ok((_, Err(e))) => Err(link_error(&self.peer, e)),
            Err(_) => {
                self.link = Link::AwaitingReply(call);
                Err(self.timed_out())
            },
        }
    }
}
