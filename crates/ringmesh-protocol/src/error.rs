//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Invalid identifier length: expected {expected} bytes, got {actual}")]
    InvalidIdLength { expected: usize, actual: usize },

    #[error("Invalid digit width: {0} bits (must be between 1 and 8)")]
    InvalidDigitWidth(u32),

    #[error("Digit index {index} out of range (identifier has {digits} digits)")]
    DigitOutOfRange { index: usize, digits: usize },
}
