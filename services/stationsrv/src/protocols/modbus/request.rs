//! The primitive operations the driver issues, and their mapping onto tokio-modbus

use tokio_modbus::{ExceptionCode, Request, Response};

use super::constants::{MODBUS_MAX_READ_COILS, MODBUS_MAX_READ_REGISTERS};
use crate::error::{Result, StationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
}

impl ModbusRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadCoils { .. } => "Read Coils",
            Self::ReadDiscreteInputs { .. } => "Read Discrete Inputs",
            Self::ReadHoldingRegisters { .. } => "Read Holding Registers",
            Self::ReadInputRegisters { .. } => "Read Input Registers",
            Self::WriteSingleCoil { .. } => "Write Single Coil",
        }
    }

    /// Reject quantities the protocol cannot carry
    pub fn validate(&self) -> Result<()> {
        let (count, max) = match *self {
            Self::ReadCoils { count, .. } | Self::ReadDiscreteInputs { count, .. } => {
                (count, MODBUS_MAX_READ_COILS)
            },
            Self::ReadHoldingRegisters { count, .. } | Self::ReadInputRegisters { count, .. } => {
                (count, MODBUS_MAX_READ_REGISTERS)
            },
            Self::WriteSingleCoil { .. } => return Ok(()),
        };
        if count == 0 || count > max {
            return Err(StationError::validation(format!(
                "{} quantity {} outside 1..={}",
                self.name(),
                count,
                max
            )));
        }
        Ok(())
    }

    pub fn to_request(self) -> Request<'static> {
        match self {
            Self::ReadCoils { address, count } => Request::ReadCoils(address, count),
            Self::ReadDiscreteInputs { address, count } => Request::ReadDiscreteInputs(address, count),
            Self::ReadHoldingRegisters { address, count } => {
                Request::ReadHoldingRegisters(address, count)
            },
            Self::ReadInputRegisters { address, count } => Request::ReadInputRegisters(address, count),
            Self::WriteSingleCoil { address, value } => Request::WriteSingleCoil(address, value),
        }
    }

    /// Server side: `None` for function codes a station controller does not serve
    pub fn from_request(request: &Request<'_>) -> Option<Self> {
        let request = match *request {
            Request::ReadCoils(address, count) => Self::ReadCoils { address, count },
            Request::ReadDiscreteInputs(address, count) => Self::ReadDiscreteInputs { address, count },
            Request::ReadHoldingRegisters(address, count) => {
                Self::ReadHoldingRegisters { address, count }
            },
            Request::ReadInputRegisters(address, count) => Self::ReadInputRegisters { address, count },
            Request::WriteSingleCoil(address, value) => Self::WriteSingleCoil { address, value },
            _ => return None,
        };
        Some(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
    CoilWritten,
}

impl ModbusResponse {
    /// Match a decoded response against the request that produced it
    pub fn from_response(request: &ModbusRequest, response: Response) -> Result<Self> {
        match (*request, response) {
            (ModbusRequest::ReadCoils { count, .. }, Response::ReadCoils(mut bits))
            | (ModbusRequest::ReadDiscreteInputs { count, .. }, Response::ReadDiscreteInputs(mut bits)) => {
                // Bits arrive padded to whole bytes
                if bits.len() < usize::from(count) {
                    return Err(StationError::data(format!(
                        "{} returned {} bits, expected {}",
                        request.name(),
                        bits.len(),
                        count
                    )));
                }
                bits.truncate(usize::from(count));
                Ok(Self::Bits(bits))
            },
            (ModbusRequest::ReadHoldingRegisters { count, .. }, Response::ReadHoldingRegisters(regs))
            | (ModbusRequest::ReadInputRegisters { count, .. }, Response::ReadInputRegisters(regs)) => {
                if regs.len() != usize::from(count) {
                    return Err(StationError::data(format!(
                        "{} returned {} registers, expected {}",
                        request.name(),
                        regs.len(),
                        count
                    )));
                }
                Ok(Self::Registers(regs))
            },
            (ModbusRequest::WriteSingleCoil { address, value }, Response::WriteSingleCoil(a, v))
                if a == address && v == value =>
            {
                Ok(Self::CoilWritten)
            },
            (request, other) => Err(StationError::protocol(format!(
                "{} answered with {:?}",
                request.name(),
                other
            ))),
        }
    }
}

/// Busy and acknowledge are transient, every other exception is final
pub fn exception_error(request: &ModbusRequest, code: ExceptionCode) -> StationError {
    let msg = format!("{} rejected with {:?}", request.name(), code);
    match code {
        ExceptionCode::Acknowledge | ExceptionCode::ServerDeviceBusy => StationError::busy(msg),
        _ => StationError::protocol(msg),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_validate_quantities() {
        let ok = ModbusRequest::ReadInputRegisters {
            address: 0,
            count: 125,
        };
        assert!(ok.validate().is_ok());

        for bad in [
            ModbusRequest::ReadInputRegisters {
                address: 0,
                count: 126,
            },
            ModbusRequest::ReadHoldingRegisters {
                address: 0,
                count: 0,
            },
            ModbusRequest::ReadCoils {
                address: 0,
                count: 2001,
            },
        ] {
            assert!(matches!(bad.validate(), Err(StationError::ValidationError(_))));
        }
    }

    #[test]
    fn test_request_conversion() {
        let req = ModbusRequest::ReadHoldingRegisters {
            address: 64,
            count: 5,
        };
        let wire = req.to_request();
        assert_eq!(wire, Request::ReadHoldingRegisters(64, 5));
        assert_eq!(ModbusRequest::from_request(&wire), Some(req));
        assert_eq!(ModbusRequest::from_request(&Request::WriteSingleRegister(1, 2)), None);
    }

    #[test]
    fn test_padded_bits_are_truncated() {
        let req = ModbusRequest::ReadDiscreteInputs {
            address: 0,
            count: 3,
        };
        let padded = Response::ReadDiscreteInputs(vec![true, false, true, false, false, false, false, false]);
        assert_eq!(
            ModbusResponse::from_response(&req, padded).unwrap(),
            ModbusResponse::Bits(vec![true, false, true])
        );
    }

    #[test]
    fn test_response_shape_is_checked() {
        let req = ModbusRequest::ReadInputRegisters {
            address: 0,
            count: 2,
        };
        let short = Response::ReadInputRegisters(vec![1]);
        assert!(matches!(
            ModbusResponse::from_response(&req, short),
            Err(StationError::DataError(_))
        ));
        let wrong = Response::ReadHoldingRegisters(vec![1, 2]);
        assert!(matches!(
            ModbusResponse::from_response(&req, wrong),
            Err(StationError::ProtocolError(_))
        ));

        let write = ModbusRequest::WriteSingleCoil {
            address: 3,
            value: true,
        };
        assert_eq!(
            ModbusResponse::from_response(&write, Response::WriteSingleCoil(3, true)).unwrap(),
            ModbusResponse::CoilWritten
        );
        assert!(ModbusResponse::from_response(&write, Response::WriteSingleCoil(3, false)).is_err());
    }

    #[test]
    fn test_exception_mapping() {
        let req = ModbusRequest::ReadCoils {
            address: 0,
            count: 1,
        };
        assert!(exception_error(&req, ExceptionCode::ServerDeviceBusy).is_transient());
        assert!(exception_error(&req, ExceptionCode::Acknowledge).is_transient());

        let err = exception_error(&req, ExceptionCode::IllegalDataAddress);
        assert!(matches!(err, StationError::ProtocolError(_)));
        assert!(!err.is_link_failure());
    }
}
