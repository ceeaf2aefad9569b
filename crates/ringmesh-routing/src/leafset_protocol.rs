//! Leaf set exchange and repair

use ringmesh_dht::LeafSet;
use ringmesh_protocol::{BroadcastLeafSet, Handle, LeafSetKind, Message};
use tracing::debug;

use crate::state::{Outbox, RoutingState};

impl RoutingState {
    /// Merge a leaf set broadcast by another node
    pub(crate) fn receive_leaf_set(&mut self, broadcast: BroadcastLeafSet, out: &mut Outbox) {
        let BroadcastLeafSet {
            from,
            leaf_set,
            kind,
        } = broadcast;

        self.learn(&from);
        for handle in leaf_set.members() {
            self.learn(handle);
        }

        match kind {
            LeafSetKind::JoinInitial => self.broadcast_leaf_set(LeafSetKind::JoinAdvertise, out),
            LeafSetKind::JoinAdvertise => {
                if self.leaf_set.member(&from.node_id()) {
                    match LeafSet::from_snapshot(&leaf_set) {
                        Ok(remote) => self.check_leaf_set(&remote, &from, out),
                        Err(e) => debug!(node = %self.local_id, error = %e, "Bad leaf set snapshot"),
                    }
                }
            }
            LeafSetKind::Update => {}
        }
    }

    /// Send our leaf set to every live member
    pub(crate) fn broadcast_leaf_set(&mut self, kind: LeafSetKind, out: &mut Outbox) {
        let snapshot = self.leaf_set.snapshot();
        for member in self.leaf_set.members() {
            if member.is_alive() {
                out.send(
                    member,
                    Message::BroadcastLeafSet(BroadcastLeafSet {
                        from: self.local.clone(),
                        leaf_set: snapshot.clone(),
                        kind,
                    }),
                );
            }
        }
    }

    /// Tell members the sender is missing about our view
    ///
    /// The sender only hears back when something was missing.
    fn check_leaf_set(&self, remote: &LeafSet, from: &Handle, out: &mut Outbox) {
        let snapshot = self.leaf_set.snapshot();
        let from_id = from.node_id();
        let update = |snapshot| {
            Message::BroadcastLeafSet(BroadcastLeafSet {
                from: self.local.clone(),
                leaf_set: snapshot,
                kind: LeafSetKind::Update,
            })
        };

        let mut missing = false;
        for member in self.leaf_set.members() {
            if member.node_id() == from_id || !member.is_alive() {
                continue;
            }
            if remote.test(&member) {
                missing = true;
                debug!(
                    node = %self.local_id,
                    missing = %member.node_id(),
                    peer = %from_id,
                    "Peer leaf set is missing a member"
                );
                out.send(member, update(snapshot.clone()));
            }
        }

        if !missing {
            return;
        }
        if let Some(from) = self.verified_live(from) {
            out.send(from, update(snapshot));
        }
    }

    /// Answer a leaf set request
    pub(crate) fn leaf_set_requested(&mut self, from: &Handle, out: &mut Outbox) {
        self.learn(from);
        if let Some(from) = self.verified_live(from) {
            out.send(
                from,
                Message::BroadcastLeafSet(BroadcastLeafSet {
                    from: self.local.clone(),
                    leaf_set: self.leaf_set.snapshot(),
                    kind: LeafSetKind::Update,
                }),
            );
        }
    }

    /// Drop dead members, then swap leaf sets with both neighbours and both
    /// edges
    ///
    /// The exchange runs every round, even with a full healthy set, so nodes
    /// that joined concurrently still find each other. Returns true if any
    /// members were lost.
    pub(crate) fn maintain_leaf_set(&mut self, out: &mut Outbox) -> bool {
        let lost = self.leaf_set.remove_dead();
        for dead in &lost {
            debug!(node = %self.local_id, dead = %dead.node_id(), "Leaf set member died");
        }
        self.stats.dead_leaves_removed += lost.len() as u64;

        // A side with no members left can only be refilled from the routing table
        if self.leaf_set.cw_size() == 0 || self.leaf_set.ccw_size() == 0 {
            let known: Vec<Handle> = self
                .routing_table
                .handles()
                .filter(|h| h.is_alive())
                .cloned()
                .collect();
            for handle in known {
                self.leaf_set.put(handle);
            }
        }

        let mut targets: Vec<Handle> = Vec::with_capacity(4);
        for candidate in [
            self.nearest_live(1),
            self.farthest_live(1),
            self.nearest_live(-1),
            self.farthest_live(-1),
        ]
        .into_iter()
        .flatten()
        {
            if !targets.iter().any(|t| t.node_id() == candidate.node_id()) {
                targets.push(candidate);
            }
        }

        let snapshot = self.leaf_set.snapshot();
        for target in targets {
            out.send(
                target.clone(),
                Message::BroadcastLeafSet(BroadcastLeafSet {
                    from: self.local.clone(),
                    leaf_set: snapshot.clone(),
                    kind: LeafSetKind::Update,
                }),
            );
            out.send(
                target,
                Message::RequestLeafSet {
                    from: self.local.clone(),
                },
            );
        }
        !lost.is_empty()
    }

    /// Nearest live member on one side, `direction` being 1 or -1
    fn nearest_live(&self, direction: isize) -> Option<Handle> {
        (1..=self.side_size(direction))
            .filter_map(|i| self.leaf_set.get(direction * i))
            .find(|h| h.is_alive())
            .cloned()
    }

    /// Farthest live member on one side, `direction` being 1 or -1
    fn farthest_live(&self, direction: isize) -> Option<Handle> {
        (1..=self.side_size(direction))
            .rev()
            .filter_map(|i| self.leaf_set.get(direction * i))
            .find(|h| h.is_alive())
            .cloned()
    }

    fn side_size(&self, direction: isize) -> isize {
        if direction > 0 {
            self.leaf_set.cw_size() as isize
        } else {
            self.leaf_set.ccw_size() as isize
        }
    }
}
