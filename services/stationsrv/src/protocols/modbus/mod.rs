//! Modbus TCP protocol support
//!
//! - `request`: the primitive operations and their tokio-modbus mapping
//! - `client`: one-shot request/response over a byte stream
//! - `resilient`: retry + serialization wrapper used by devices

pub mod client;
pub mod constants;
pub mod request;
pub mod resilient;

pub use client::{RegisterClient, TcpRegisterClient};
pub use request::{ModbusRequest, ModbusResponse};
pub use resilient::{
    elapsed_ms_or_sentinel, ResilientTransport, RetryPolicy, Timed, TransportStats,
    ELAPSED_SENTINEL_MS,
};
