//! Shared basic library for the station gateway services
//!
//! Provides functions shared by every service binary:
//! - logging bootstrap (console + optional daily-rolling file)
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{init, init_with_config, LogConfig};
pub use shutdown::{shutdown_token, wait_for_shutdown};
