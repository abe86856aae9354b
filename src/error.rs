//! # Gateway Error Handling
//!
//! This module defines the Error enum, which represents the different error
//! types that can occur in the tinybms-rs crate.

use thiserror::Error;

/// Represents the different error types that can occur in the gateway.
#[derive(Debug, Error)]
pub enum Error {
    /// Indicates that the reply window for a serial request was exceeded.
    #[error("Response timeout after {0} ms")]
    Timeout(u64),

    /// Indicates a hardware or driver-level I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Indicates a corrupt or unexpected frame on the serial link.
    #[error("Frame decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Indicates that a post-write readback returned a different value.
    #[error("Write verify mismatch at 0x{address:04X}: wrote 0x{written:04X}, read back 0x{read_back:04X}")]
    VerifyMismatch {
        address: u16,
        written: u16,
        read_back: u16,
    },

    /// Indicates a programmer or user error in a request argument.
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// Indicates a register write value outside the register's numeric range.
    #[error("Value {value} out of range for register 0x{address:04X}")]
    OutOfRange { address: u16, value: f64 },

    /// Indicates a durable-store write or read failure.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Indicates the CAN controller has gone bus-off.
    #[error("CAN controller is bus-off")]
    BusOff,

    /// Indicates a mutex was not acquired within its time budget.
    #[error("Lock on {0} not acquired within its time budget")]
    LockBudget(&'static str),

    /// A catch-all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}

/// Represents the ways a TinyBMS reply frame can fail to decode.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    /// The frame did not start with the 0xAA sync byte.
    #[error("Bad sync byte: expected 0xAA, got 0x{0:02X}")]
    BadSync(u8),

    /// The echoed command did not match the request.
    #[error("Bad command echo: expected 0x{expected:02X}, got 0x{actual:02X}")]
    BadCmd { expected: u8, actual: u8 },

    /// The payload length field disagrees with the buffer contents.
    #[error("Bad frame length: {0}")]
    BadLength(String),

    /// The CRC-16 over the frame body did not match the trailer.
    #[error("Invalid CRC: expected 0x{expected:04X}, calculated 0x{calculated:04X}")]
    BadCrc { expected: u16, calculated: u16 },

    /// The BMS refused the request with the given error code.
    #[error("Device error 0x{0:02X}")]
    DeviceError(u8),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
