//! RingMesh Protocol Module
//!
//! This module defines the identifier space, the node handle capability and
//! the messages exchanged by overlay nodes.

pub mod error;
pub mod handle;
pub mod message;
pub mod types;

pub use error::{ProtocolError, Result};
pub use handle::{Handle, NodeHandle, PROXIMITY_UNKNOWN};
pub use message::{
    AppMessage, AppTag, BroadcastLeafSet, BroadcastRouteRow, Credentials, JoinRejection,
    JoinRequest, LeafSetKind, LeafSetSnapshot, Message, RouteMessage, RouteRow, RoutedPayload,
};
pub use types::{Distance, Id, ID_BIT_LENGTH, ID_SIZE};
