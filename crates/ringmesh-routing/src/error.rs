//! Routing error types

use thiserror::Error;

use crate::security::VerifyError;

/// Routing-specific errors
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Untrusted handle: {0}")]
    UntrustedHandle(#[from] VerifyError),

    #[error("Bootstrap node {0} is unreachable")]
    BootstrapUnreachable(String),

    #[error("Join timed out after {0}ms")]
    JoinTimeout(u64),

    #[error("Identifier {0} is already owned by another node")]
    IdCollision(String),

    #[error("No application registered for {0}")]
    UnknownApplication(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Node has shut down")]
    NodeShutdown,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ringmesh_protocol::ProtocolError),

    #[error("DHT error: {0}")]
    Dht(#[from] ringmesh_dht::DhtError),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;
