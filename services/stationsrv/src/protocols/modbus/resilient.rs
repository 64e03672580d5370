//! Retrying, serialized wrapper around a register client
//!
//! Every primitive call holds the client lock for its whole retry loop, so
//! retries of one call never interleave with another call on the same link.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::client::RegisterClient;
use super::request::{ModbusRequest, ModbusResponse};
use crate::error::{Result, StationError};

/// Reported in place of an elapsed time when a call failed
pub const ELAPSED_SENTINEL_MS: i64 = -1;

/// A value plus the wall-clock time of the attempt that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<T> {
    pub value: T,
    pub elapsed: Duration,
}

/// Elapsed milliseconds of a successful call, or [`ELAPSED_SENTINEL_MS`]
pub fn elapsed_ms_or_sentinel<T>(result: &Result<Timed<T>>) -> i64 {
    match result {
        Ok(timed) => timed.elapsed.as_millis() as i64,
        Err(_) => ELAPSED_SENTINEL_MS,
    }
}

/// Retry budget for one primitive call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt `attempt` (0-based): `base × 2^attempt`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub calls: u64,
    pub retries: u64,
    pub failures: u64,
    /// Failures that used up every attempt on transient errors
    pub exhausted: u64,
    pub total_elapsed_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    exhausted: AtomicU64,
    elapsed_us: AtomicU64,
}

pub struct ResilientTransport {
    client: Mutex<Box<dyn RegisterClient>>,
    policy: RetryPolicy,
    counters: Counters,
}

impl std::fmt::Debug for ResilientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientTransport")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResilientTransport {
    pub fn new(client: Box<dyn RegisterClient>, policy: RetryPolicy) -> Self {
        Self {
            client: Mutex::new(client),
            policy,
            counters: Counters::default(),
        }
    }

    pub async fn read_coils(&self, address: u16, count: u16) -> Result<Timed<Vec<bool>>> {
        let timed = self
            .call(ModbusRequest::ReadCoils { address, count })
            .await?;
        expect_bits(timed)
    }

    pub async fn read_discrete_inputs(&self, address: u16, count: u16) -> Result<Timed<Vec<bool>>> {
        let timed = self
            .call(ModbusRequest::ReadDiscreteInputs { address, count })
            .await?;
        expect_bits(timed)
    }

    pub async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Timed<Vec<u16>>> {
        let timed = self
            .call(ModbusRequest::ReadHoldingRegisters { address, count })
            .await?;
        expect_registers(timed)
    }

    pub async fn read_input_registers(&self, address: u16, count: u16) -> Result<Timed<Vec<u16>>> {
        let timed = self
            .call(ModbusRequest::ReadInputRegisters { address, count })
            .await?;
        expect_registers(timed)
    }

    pub async fn write_single_coil(&self, address: u16, value: bool) -> Result<Timed<()>> {
        let timed = self
            .call(ModbusRequest::WriteSingleCoil { address, value })
            .await?;
        match timed.value {
            ModbusResponse::CoilWritten => Ok(Timed {
                value: (),
                elapsed: timed.elapsed,
            }),
            other => Err(unexpected(&other)),
        }
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            total_elapsed_ms: self.counters.elapsed_us.load(Ordering::Relaxed) / 1000,
        }
    }

    async fn call(&self, request: ModbusRequest) -> Result<Timed<ModbusResponse>> {
        let mut client = self.client.lock().await;
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            match client.execute(request).await {
                Ok(value) => {
                    let elapsed = started.elapsed();
                    self.counters
                        .elapsed_us
                        .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
                    debug!("{:?} ok in {:?} (attempt {})", request, elapsed, attempt + 1);
                    return Ok(Timed { value, elapsed });
                },
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.policy.backoff_for(attempt);
                    warn!(
                        "{:?} attempt {}/{} failed: {}, retrying in {:?}",
                        request,
                        attempt + 1,
                        max_attempts,
                        e,
                        delay
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    if e.is_transient() {
                        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                        warn!("{:?} gave up after {} attempts: {}", request, max_attempts, e);
                    }
                    return Err(e);
                },
            }
        }
    }
}

fn expect_bits(timed: Timed<ModbusResponse>) -> Result<Timed<Vec<bool>>> {
    match timed.value {
        ModbusResponse::Bits(bits) => Ok(Timed {
            value: bits,
            elapsed: timed.elapsed,
        }),
        other => Err(unexpected(&other)),
    }
}

fn expect_registers(timed: Timed<ModbusResponse>) -> Result<Timed<Vec<u16>>> {
    match timed.value {
        ModbusResponse::Registers(regs) => Ok(Timed {
            value: regs,
            elapsed: timed.elapsed,
        }),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &ModbusResponse) -> StationError {
    StationError::protocol(format!("Unexpected response shape: {response:?}"))
}
