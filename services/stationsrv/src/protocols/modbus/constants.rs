//! Modbus protocol limits
//!
//! A 253-byte PDU inherited from the RS485 ADU, with register and coil
//! counts sized to fit it.

/// Maximum PDU size: RS485 ADU (256) - address (1) - CRC (2)
pub const MAX_PDU_SIZE: usize = 253;

/// FC03/FC04: 1 + 1 + N × 2 ≤ 253 → N ≤ 125
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

/// FC01/FC02: 1 + 1 + ceil(N / 8) ≤ 253, rounded down to 2000
pub const MODBUS_MAX_READ_COILS: u16 = 2000;
