//! Overlay protocol messages
//!
//! Messages are exchanged in-process through [`NodeHandle::deliver`]. Encoding
//! them for a wire is the transport's business, so they carry live handles
//! rather than addresses.
//!
//! [`NodeHandle::deliver`]: crate::handle::NodeHandle::deliver

use std::fmt;

use crate::handle::Handle;
use crate::types::Id;

/// Tag selecting the application a routed payload belongs to
///
/// Each application picks its tag when it registers with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppTag(u16);

impl AppTag {
    pub const fn new(tag: u16) -> Self {
        AppTag(tag)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for AppTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app#{}", self.0)
    }
}

/// Credentials attached to a routed message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    /// No authentication
    #[default]
    Permissive,
    /// Opaque credential bytes checked by a verifier above the core
    Opaque(Vec<u8>),
}

/// One routing-table row, indexed by digit value
///
/// Empty slots are empty vectors.
pub type RouteRow = Vec<Vec<Handle>>;

/// Copy of a leaf set for broadcasting
#[derive(Debug, Clone)]
pub struct LeafSetSnapshot {
    /// Owner of the leaf set
    pub base: Handle,
    /// Per-side capacity of the owner's leaf set
    pub half_size: usize,
    /// Clockwise side, nearest first
    pub cw: Vec<Handle>,
    /// Counterclockwise side, nearest first
    pub ccw: Vec<Handle>,
}

impl LeafSetSnapshot {
    /// All members from the farthest counterclockwise to the farthest clockwise
    pub fn members(&self) -> impl Iterator<Item = &Handle> {
        self.ccw.iter().rev().chain(self.cw.iter())
    }
}

/// Why a leaf set is being broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafSetKind {
    /// Initial leaf set handed to a node that just joined
    JoinInitial,
    /// A newly joined node advertising itself to its leaf set
    JoinAdvertise,
    /// Steady-state update or reply to a request
    Update,
}

#[derive(Debug, Clone)]
pub struct BroadcastLeafSet {
    pub from: Handle,
    pub leaf_set: LeafSetSnapshot,
    pub kind: LeafSetKind,
}

#[derive(Debug, Clone)]
pub struct BroadcastRouteRow {
    pub from: Handle,
    pub row_index: usize,
    pub row: RouteRow,
}

/// Join request carried toward the joiner's own identifier
#[derive(Debug, Clone)]
pub struct JoinRequest {
    origin: Handle,
    token: u64,
    rows: Vec<Option<RouteRow>>,
    next_row: usize,
    accepted_by: Option<Handle>,
    leaf_set: Option<LeafSetSnapshot>,
}

impl JoinRequest {
    pub fn new(origin: Handle, token: u64, num_rows: usize) -> Self {
        JoinRequest {
            origin,
            token,
            rows: vec![None; num_rows],
            next_row: 0,
            accepted_by: None,
            leaf_set: None,
        }
    }

    /// The joining node
    pub fn origin(&self) -> &Handle {
        &self.origin
    }

    /// Token minted by the joiner for this attempt
    pub fn token(&self) -> u64 {
        self.token
    }

    /// First row not yet collected
    pub fn next_row(&self) -> usize {
        self.next_row
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Record row `index` if it has not been collected yet
    pub fn push_row(&mut self, index: usize, row: RouteRow) {
        if index < self.next_row || index >= self.rows.len() {
            return;
        }
        self.rows[index] = Some(row);
        self.next_row = index + 1;
    }

    pub fn row(&self, index: usize) -> Option<&RouteRow> {
        self.rows.get(index).and_then(|r| r.as_ref())
    }

    /// Collected rows with their indices
    pub fn rows(&self) -> impl Iterator<Item = (usize, &RouteRow)> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|row| (i, row)))
    }

    /// Stamp the request at its terminal node
    pub fn accept(&mut self, terminal: Handle, leaf_set: LeafSetSnapshot) {
        self.accepted_by = Some(terminal);
        self.leaf_set = Some(leaf_set);
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted_by.is_some()
    }

    /// Node that accepted the request
    pub fn terminal(&self) -> Option<&Handle> {
        self.accepted_by.as_ref()
    }

    /// Leaf set stamped by the terminal node
    pub fn leaf_set(&self) -> Option<&LeafSetSnapshot> {
        self.leaf_set.as_ref()
    }
}

/// Reason a join was refused by its terminal node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    /// The terminal node already owns the joiner's identifier
    IdCollision,
}

/// Application payload carried by a route message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    pub tag: AppTag,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum RoutedPayload {
    Join(JoinRequest),
    App(AppMessage),
}

/// In-flight message routed by key
#[derive(Debug, Clone)]
pub struct RouteMessage {
    /// Key selecting the destination by numeric closeness
    pub target: Id,
    /// Node that first routed the message
    pub source: Id,
    pub payload: RoutedPayload,
    pub credentials: Credentials,
    /// Node that forwarded the message to the current hop
    pub prev_hop: Option<Handle>,
    /// Overlay hops taken so far
    pub hops: u32,
}

impl RouteMessage {
    pub fn new(target: Id, source: Id, payload: RoutedPayload, credentials: Credentials) -> Self {
        RouteMessage {
            target,
            source,
            payload,
            credentials,
            prev_hop: None,
            hops: 0,
        }
    }
}

/// Everything a node can receive
#[derive(Debug, Clone)]
pub enum Message {
    /// Message routed by key
    Route(RouteMessage),
    /// Ask the local node to join through a bootstrap node
    InitiateJoin { bootstrap: Handle },
    /// Accepted join request returning to the joiner
    JoinRequest(JoinRequest),
    /// Join refused by the terminal node
    JoinRejected {
        token: u64,
        terminal: Handle,
        reason: JoinRejection,
    },
    BroadcastLeafSet(BroadcastLeafSet),
    RequestLeafSet { from: Handle },
    BroadcastRouteRow(BroadcastRouteRow),
    RequestRouteRow { from: Handle, row: usize },
    /// Run leaf-set and route-set maintenance
    InitiateMaintenance,
}

impl Message {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Route(_) => "route",
            Message::InitiateJoin { .. } => "initiate-join",
            Message::JoinRequest(_) => "join-request",
            Message::JoinRejected { .. } => "join-rejected",
            Message::BroadcastLeafSet(_) => "broadcast-leaf-set",
            Message::RequestLeafSet { .. } => "request-leaf-set",
            Message::BroadcastRouteRow(_) => "broadcast-route-row",
            Message::RequestRouteRow { .. } => "request-route-row",
            Message::InitiateMaintenance => "initiate-maintenance",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{NodeHandle, PROXIMITY_UNKNOWN};
    use std::any::Any;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Stub(Id);

    impl NodeHandle for Stub {
        fn node_id(&self) -> Id {
            self.0
        }
        fn is_alive(&self) -> bool {
            true
        }
        fn proximity(&self) -> u32 {
            PROXIMITY_UNKNOWN
        }
        fn deliver(&self, _message: Message) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn stub(v: u128) -> Handle {
        Arc::new(Stub(Id::from_u128(v)))
    }

    #[test]
    fn test_join_request_collects_rows_in_order() {
        let mut jr = JoinRequest::new(stub(1), 7, 32);
        assert_eq!(jr.next_row(), 0);

        jr.push_row(0, vec![vec![stub(2)]]);
        jr.push_row(1, vec![vec![], vec![stub(3)]]);
        assert_eq!(jr.next_row(), 2);

        // Rows already collected are not overwritten
        jr.push_row(1, vec![]);
        assert_eq!(jr.row(1).map(|r| r.len()), Some(2));

        // Out of range rows are ignored
        jr.push_row(40, vec![]);
        assert_eq!(jr.next_row(), 2);

        let collected: Vec<usize> = jr.rows().map(|(i, _)| i).collect();
        assert_eq!(collected, vec![0, 1]);
    }

    #[test]
    fn test_join_request_accept() {
        let mut jr = JoinRequest::new(stub(1), 7, 4);
        assert!(!jr.is_accepted());

        let snapshot = LeafSetSnapshot {
            base: stub(9),
            half_size: 2,
            cw: vec![stub(10)],
            ccw: vec![stub(8), stub(7)],
        };
        jr.accept(stub(9), snapshot);

        assert!(jr.is_accepted());
        assert_eq!(jr.terminal().map(|h| h.node_id()), Some(Id::from_u128(9)));
        let members: Vec<u128> = jr
            .leaf_set()
            .unwrap()
            .members()
            .map(|h| h.node_id().as_u128())
            .collect();
        assert_eq!(members, vec![7, 8, 10]);
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(Message::InitiateMaintenance.kind(), "initiate-maintenance");
        let rm = RouteMessage::new(
            Id::from_u128(5),
            Id::from_u128(1),
            RoutedPayload::App(AppMessage {
                tag: AppTag::new(3),
                body: vec![1, 2, 3],
            }),
            Credentials::default(),
        );
        assert_eq!(rm.hops, 0);
        assert_eq!(Message::Route(rm).kind(), "route");
    }
}
