//! Error handling for the station service
//!
//! One flat error enum with string payloads. Classification helpers decide
//! what the resilient transport retries and how the poller reports failures.

use thiserror::Error;

/// Station Service Error Type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StationError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Malformed frames, unexpected function codes, exception responses
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Short buffers and undecodable register contents
    #[error("Data error: {0}")]
    DataError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Controller reported a temporary condition (busy / acknowledge)
    #[error("Device busy: {0}")]
    BusyError(String),

    /// Device, channel or pending connection absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation attempted while the device is not connected
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Bad tag format, out-of-range channel index, bad address
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for the station service
pub type Result<T> = std::result::Result<T, StationError>;

impl StationError {
    pub fn config(msg: impl Into<String>) -> Self {
        StationError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        StationError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        StationError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        StationError::ConnectionError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        StationError::DataError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        StationError::TimeoutError(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        StationError::BusyError(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        StationError::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        StationError::ValidationError(msg.into())
    }

    // Convenience constructors for specific cases
    pub fn not_connected(device: impl std::fmt::Display) -> Self {
        StationError::NotConnected(format!("device {device}"))
    }

    pub fn device_not_found(name: impl std::fmt::Display) -> Self {
        StationError::NotFound(format!("Device does not exist: {name}"))
    }

    pub fn channel_out_of_range(tag: impl std::fmt::Display, count: u16) -> Self {
        StationError::ValidationError(format!(
            "Channel {tag} out of range (device exposes {count})"
        ))
    }

    /// Temporary conditions worth another attempt inside one primitive call
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimeoutError(_) | Self::BusyError(_))
    }

    /// The link itself is unusable; the device must reconnect
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::IoError(_) | Self::TimeoutError(_)
        )
    }

    /// Prefix the message with the operation that failed, keeping the variant
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Self::ConfigError(m) => Self::ConfigError(format!("{ctx}: {m}")),
            Self::IoError(m) => Self::IoError(format!("{ctx}: {m}")),
            Self::ProtocolError(m) => Self::ProtocolError(format!("{ctx}: {m}")),
            Self::ConnectionError(m) => Self::ConnectionError(format!("{ctx}: {m}")),
            Self::DataError(m) => Self::DataError(format!("{ctx}: {m}")),
            Self::TimeoutError(m) => Self::TimeoutError(format!("{ctx}: {m}")),
            Self::BusyError(m) => Self::BusyError(format!("{ctx}: {m}")),
            Self::NotFound(m) => Self::NotFound(format!("{ctx}: {m}")),
            Self::NotConnected(m) => Self::NotConnected(format!("{ctx}: {m}")),
            Self::ValidationError(m) => Self::ValidationError(format!("{ctx}: {m}")),
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for StationError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => StationError::TimeoutError(err.to_string()),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => StationError::ConnectionError(err.to_string()),
            _ => StationError::IoError(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for StationError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        StationError::TimeoutError(err.to_string())
    }
}

impl From<serde_json::Error> for StationError {
    fn from(err: serde_json::Error) -> Self {
        StationError::DataError(format!("JSON: {err}"))
    }
}

impl From<figment::Error> for StationError {
    fn from(err: figment::Error) -> Self {
        StationError::ConfigError(err.to_string())
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn io_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn data_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| StationError::ConfigError(format!("{msg}: {e}")))
    }

    fn io_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| StationError::IoError(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| StationError::ProtocolError(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| StationError::ConnectionError(format!("{msg}: {e}")))
    }

    fn data_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| StationError::DataError(format!("{msg}: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StationError::timeout("read").is_transient());
        assert!(StationError::busy("exception 6").is_transient());

        assert!(!StationError::protocol("bad fc").is_transient());
        assert!(!StationError::connection("refused").is_transient());
        assert!(!StationError::not_found("x").is_transient());
        assert!(!StationError::validation("AI-x").is_transient());
        assert!(!StationError::data("short").is_transient());
    }

    #[test]
    fn test_link_failure_classification() {
        assert!(StationError::connection("reset by peer").is_link_failure());
        assert!(StationError::timeout("no reply").is_link_failure());
        assert!(StationError::io("broken").is_link_failure());

        assert!(!StationError::busy("exception 6").is_link_failure());
        assert!(!StationError::protocol("exception 2").is_link_failure());
        assert!(!StationError::validation("AI-9").is_link_failure());
    }

    #[test]
    fn test_io_error_mapping() {
        let timed_out: StationError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(timed_out, StationError::TimeoutError(_)));

        let eof: StationError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(eof, StationError::ConnectionError(_)));

        let other: StationError = std::io::Error::other("weird").into();
        assert!(matches!(other, StationError::IoError(_)));
    }

    #[test]
    fn test_with_context_keeps_variant() {
        let err = StationError::timeout("no reply").with_context("GetModel");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Timeout error: GetModel: no reply");
    }

    #[test]
    fn test_error_ext() {
        let res: std::result::Result<u8, &str> = Err("boom");
        let err = res.protocol_error("decode").unwrap_err();
        assert_eq!(err, StationError::ProtocolError("decode: boom".to_string()));
    }
}
