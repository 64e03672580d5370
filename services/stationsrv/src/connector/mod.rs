//! Transport connectors
//!
//! A connector hands the device a register client on a fresh link. The
//! connect string picks the implementation: a socket address or `host:port`
//! dials out directly, a hardware address takes a link the rendezvous
//! listener already accepted.

pub mod direct;
pub mod rendezvous;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StationError};
use crate::protocols::modbus::TcpRegisterClient;
use crate::station::MacAddress;

pub use direct::DirectConnector;
pub use rendezvous::{RendezvousConnector, RendezvousListener, RendezvousSettings};

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TcpRegisterClient>;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}

/// Parsed form of a device connect string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Socket(SocketAddr),
    Mac(MacAddress),
    /// `hostname:port`, resolved at dial time
    Host(String),
}

/// Socket address first, then hardware address, then `host:port`
pub fn parse_target(address: &str) -> Result<ConnectTarget> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(ConnectTarget::Socket(addr));
    }
    if let Ok(mac) = address.parse::<MacAddress>() {
        return Ok(ConnectTarget::Mac(mac));
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() => {
            Ok(ConnectTarget::Host(address.to_string()))
        },
        _ => Err(StationError::validation(format!(
            "'{address}' is neither host:port nor a hardware address"
        ))),
    }
}

/// Build the connector for a connect string
pub fn select_connector(
    address: &str,
    connect_timeout: Duration,
    rendezvous: Option<Arc<RendezvousListener>>,
) -> Result<Box<dyn Connector>> {
    match parse_target(address)? {
        ConnectTarget::Socket(addr) => Ok(Box::new(DirectConnector::new(
            addr.to_string(),
            connect_timeout,
        ))),
        ConnectTarget::Host(host) => Ok(Box::new(DirectConnector::new(host, connect_timeout))),
        ConnectTarget::Mac(mac) => {
            let listener = rendezvous.ok_or_else(|| {
                StationError::config(format!(
                    "{mac} needs the rendezvous listener, which is not enabled"
                ))
            })?;
            Ok(Box::new(RendezvousConnector::new(listener, mac)))
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("192.168.1.10:502").unwrap(),
            ConnectTarget::Socket("192.168.1.10:502".parse().unwrap())
        );
        assert_eq!(
            parse_target("[::1]:502").unwrap(),
            ConnectTarget::Socket("[::1]:502".parse().unwrap())
        );
        assert_eq!(
            parse_target(" 00:1A:2B:3C:4D:5E ").unwrap(),
            ConnectTarget::Mac("00:1a:2b:3c:4d:5e".parse().unwrap())
        );
        assert_eq!(
            parse_target("station-7.local:502").unwrap(),
            ConnectTarget::Host("station-7.local:502".to_string())
        );
    }

    #[test]
    fn test_parse_target_rejects_garbage() {
        for bad in ["", "pump", "host:", ":502", "host:99999", "00:1a:2b"] {
            assert!(
                matches!(parse_target(bad), Err(StationError::ValidationError(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_mac_without_listener_is_config_error() {
        let err = select_connector("00:1a:2b:3c:4d:5e", Duration::from_secs(1), None)
            .err()
            .unwrap();
        assert!(matches!(err, StationError::ConfigError(_)));
    }

    #[test]
    fn test_direct_selection() {
        let connector = select_connector("127.0.0.1:1502", Duration::from_secs(1), None).unwrap();
        assert_eq!(connector.describe(), "tcp://127.0.0.1:1502");
    }
}
