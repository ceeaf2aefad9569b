//! Per-node routing state and the outbox its handlers fill

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use ringmesh_dht::{LeafSet, RoutingTable};
use ringmesh_protocol::{AppTag, Handle, Id, Message};
use serde::{Deserialize, Serialize};

use crate::config::OverlayConfig;
use crate::error::Result;
use crate::security::Verifier;

/// Why a join attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinFailure {
    /// The terminal node already owns our identifier
    IdCollision,
    /// No terminal response arrived in time
    Timeout,
}

/// Join lifecycle of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    /// Join request in flight, identified by its token
    Joining { token: u64 },
    Ready,
    Failed(JoinFailure),
}

impl JoinState {
    pub fn is_ready(&self) -> bool {
        matches!(self, JoinState::Ready)
    }
}

/// Membership and join notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    LeafSetChanged { node: Id, added: bool },
    RouteSetChanged { node: Id, added: bool },
    JoinCompleted { terminal: Id },
    JoinFailed { reason: JoinFailure },
}

/// Application payload delivered at the node closest to its key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: AppTag,
    pub key: Id,
    pub source: Id,
    pub body: Vec<u8>,
    /// Overlay hops the message took
    pub hops: u32,
}

/// Router statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub messages_forwarded: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub protocol_violations: u64,
    pub dead_leaves_removed: u64,
    pub joins_accepted: u64,
    pub join_collisions: u64,
    pub hole_repairs: u64,
    pub maintenance_rounds: u64,
}

/// Work produced while the state lock is held, flushed after release
#[derive(Debug, Default)]
pub struct Outbox {
    pub sends: Vec<(Handle, Message)>,
    pub deliveries: Vec<Delivery>,
    pub events: Vec<OverlayEvent>,
    /// Set when the join state changed
    pub join_state: Option<JoinState>,
}

impl Outbox {
    pub fn send(&mut self, to: Handle, message: Message) {
        self.sends.push((to, message));
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
            && self.deliveries.is_empty()
            && self.events.is_empty()
            && self.join_state.is_none()
    }
}

/// Everything one node routes with
///
/// Handlers in the router and protocol modules mutate it inside a single
/// critical section and leave their side effects in an [`Outbox`].
#[derive(Debug)]
pub struct RoutingState {
    pub(crate) local: Handle,
    pub(crate) local_id: Id,
    pub(crate) config: OverlayConfig,
    pub(crate) leaf_set: LeafSet,
    pub(crate) routing_table: RoutingTable,
    pub(crate) join: JoinState,
    pub(crate) stats: RouterStats,
    pub(crate) rng: StdRng,
    pub(crate) verifier: Arc<dyn Verifier>,
}

impl RoutingState {
    pub fn new(local: Handle, config: OverlayConfig, verifier: Arc<dyn Verifier>) -> Result<Self> {
        Self::with_rng(local, config, verifier, StdRng::from_entropy())
    }

    /// Same as [`RoutingState::new`], drawing join tokens and maintenance
    /// picks from `rng`
    pub fn with_rng(
        local: Handle,
        config: OverlayConfig,
        verifier: Arc<dyn Verifier>,
        rng: StdRng,
    ) -> Result<Self> {
        config.validate()?;
        let leaf_set = LeafSet::new(local.clone(), config.leaf_set_half_size)?;
        let routing_table =
            RoutingTable::new(local.clone(), config.digit_bits, config.route_set_size)?;
        let local_id = local.node_id();

        Ok(RoutingState {
            local,
            local_id,
            config,
            leaf_set,
            routing_table,
            join: JoinState::Idle,
            stats: RouterStats::default(),
            rng,
            verifier,
        })
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn leaf_set(&self) -> &LeafSet {
        &self.leaf_set
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn join_state(&self) -> JoinState {
        self.join
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Verified handle if the node behind it is live
    pub(crate) fn verified_live(&self, handle: &Handle) -> Option<Handle> {
        match self.verifier.verify_handle(handle) {
            Ok(verified) if verified.is_alive() => Some(verified),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(node = %self.local_id, error = %e, "Ignoring untrusted handle");
                None
            }
        }
    }

    /// Offer a verified live handle to both the leaf set and the routing table
    pub(crate) fn learn(&mut self, handle: &Handle) {
        if handle.node_id() == self.local_id {
            return;
        }
        if let Some(verified) = self.verified_live(handle) {
            self.leaf_set.put(verified.clone());
            self.routing_table.put(verified);
        }
    }

    pub(crate) fn set_join_state(&mut self, state: JoinState, out: &mut Outbox) {
        self.join = state;
        out.join_state = Some(state);
    }

    /// One round of leaf set and routing table maintenance
    pub(crate) fn maintain(&mut self, out: &mut Outbox) {
        self.stats.maintenance_rounds += 1;
        self.maintain_leaf_set(out);
        self.maintain_route_table(out);
    }

    /// Move recorded membership changes into the outbox as events
    pub(crate) fn collect_changes(&mut self, out: &mut Outbox) {
        for change in self.leaf_set.drain_changes() {
            out.events.push(OverlayEvent::LeafSetChanged {
                node: change.handle.node_id(),
                added: change.added,
            });
        }
        for change in self.routing_table.drain_changes() {
            out.events.push(OverlayEvent::RouteSetChanged {
                node: change.handle.node_id(),
                added: change.added,
            });
        }
    }
}
