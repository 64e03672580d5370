//! Wire protocols spoken to station controllers

pub mod modbus;
