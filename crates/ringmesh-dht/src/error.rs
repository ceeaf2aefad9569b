//! DHT error types

use thiserror::Error;

/// Errors raised while building overlay routing state
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Invalid leaf set size: {0} (each side needs at least one slot)")]
    InvalidLeafSetSize(usize),

    #[error("Invalid digit width: {0} bits (must be between 1 and 8)")]
    InvalidDigitWidth(u32),

    #[error("Invalid route set size: {0} (each slot needs at least one entry)")]
    InvalidRouteSetSize(usize),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ringmesh_protocol::ProtocolError),
}

/// Result type for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;
