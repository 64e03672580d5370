//! Station Service (stationsrv)
//!
//! Device protocol driver and real-time data engine for pump, fan and
//! inverter station controllers reached over Modbus TCP.
//!
//! # Layers
//!
//! - [`codec`]: UTF-16 text, word-swapped floats, decimal truncation
//! - [`protocols::modbus`]: framing, client, retrying transport
//! - [`connector`]: direct dial and rendezvous (controller dials in)
//! - [`station`]: register map, descriptors, real-time cache, alarms, device
//! - [`service`]: polling loops and reconnect pacing
//! - [`sink`]: where measurements and status events go
//! - [`simulator`]: in-process controller for tests and development

pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod protocols;
pub mod service;
pub mod simulator;
pub mod sink;
pub mod station;

pub use error::{Result, StationError};
