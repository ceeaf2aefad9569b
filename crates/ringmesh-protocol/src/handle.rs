//! Node handle capability
//!
//! The overlay never talks to the network directly. Transports hand it
//! [`NodeHandle`]s, and everything the routing core needs to know about a
//! remote node goes through this trait.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::message::Message;
use crate::types::Id;

/// Proximity reported for a node that has not been measured yet
pub const PROXIMITY_UNKNOWN: u32 = u32::MAX;

/// Capability to reach one remote (or the local) overlay node
///
/// Liveness and proximity are driven by the transport and may be stale.
pub trait NodeHandle: Send + Sync + fmt::Debug {
    /// Identifier of the node behind this handle
    fn node_id(&self) -> Id;

    /// Transport's current belief about liveness
    fn is_alive(&self) -> bool;

    /// Advisory latency estimate, lower is nearer
    fn proximity(&self) -> u32;

    /// Fire-and-forget delivery of a message to the node
    fn deliver(&self, message: Message);

    /// Concrete handle access for the transport's own verification layer
    fn as_any(&self) -> &dyn Any;
}

/// Shared reference to a node handle
pub type Handle = Arc<dyn NodeHandle>;
