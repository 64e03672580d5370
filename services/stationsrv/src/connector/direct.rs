//! Outbound TCP dial

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::Connector;
use crate::error::{Result, StationError};
use crate::protocols::modbus::TcpRegisterClient;

#[derive(Debug, Clone)]
pub struct DirectConnector {
    target: String,
    connect_timeout: Duration,
}

impl DirectConnector {
    pub fn new(target: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self) -> Result<TcpRegisterClient> {
        debug!("Dialing {}", self.target);
        match timeout(self.connect_timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY on {}: {}", self.target, e);
                }
                Ok(TcpRegisterClient::attach(stream, self.describe()))
            },
            Ok(Err(e)) => Err(StationError::connection(format!(
                "Failed to connect to {}: {}",
                self.target, e
            ))),
            Err(_) => Err(StationError::timeout(format!(
                "Connection to {} timed out after {:?}",
                self.target, self.connect_timeout
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.target)
    }
}
