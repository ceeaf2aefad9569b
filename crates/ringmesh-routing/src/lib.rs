//! RingMesh Message Routing
//!
//! This module implements prefix routing over a circular identifier space:
//! - Routing decisions from the leaf set and the prefix routing table
//! - The join protocol for new nodes
//! - Leaf set and routing table maintenance
//! - A per-node engine and an in-process direct network

pub mod config;
pub mod direct;
pub mod error;
mod join;
mod leafset_protocol;
pub mod node;
pub mod router;
mod routeset_protocol;
pub mod security;
pub mod state;

#[cfg(test)]
mod test_util;

pub use config::OverlayConfig;
pub use direct::{Address, DirectHandle, DirectNetwork, DirectVerifier, Topology};
pub use error::{Result, RoutingError};
pub use node::OverlayNode;
pub use router::{HopSource, NextHop};
pub use security::{PermissiveVerifier, Verifier, VerifyError};
pub use state::{
    Delivery, JoinFailure, JoinState, OverlayEvent, Outbox, RouterStats, RoutingState,
};
