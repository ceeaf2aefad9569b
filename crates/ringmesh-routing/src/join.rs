//! Join protocol
//!
//! A joining node routes a request toward its own identifier through a
//! bootstrap node. Every hop appends routing table rows and learns about the
//! joiner. The terminal node, numerically closest to the joiner, stamps its
//! leaf set and hands the request straight back.

use rand::Rng;
use ringmesh_protocol::{
    BroadcastLeafSet, BroadcastRouteRow, Credentials, Handle, JoinRejection, JoinRequest,
    LeafSetKind, Message, RouteMessage, RoutedPayload,
};
use tracing::{debug, info, warn};

use crate::error::{Result, RoutingError};
use crate::router::NextHop;
use crate::state::{JoinFailure, JoinState, OverlayEvent, Outbox, RoutingState};

impl RoutingState {
    /// Start joining the overlay through `bootstrap`
    ///
    /// Returns the token identifying this attempt.
    pub fn initiate_join(&mut self, bootstrap: &Handle, out: &mut Outbox) -> Result<u64> {
        let bootstrap = self.verifier.verify_handle(bootstrap)?;
        if !bootstrap.is_alive() {
            return Err(RoutingError::BootstrapUnreachable(
                bootstrap.node_id().to_string(),
            ));
        }

        let token: u64 = self.rng.gen();
        self.set_join_state(JoinState::Joining { token }, out);

        let request = JoinRequest::new(self.local.clone(), token, self.routing_table.num_rows());
        let mut route = RouteMessage::new(
            self.local_id,
            self.local_id,
            RoutedPayload::Join(request),
            Credentials::default(),
        );
        route.prev_hop = Some(self.local.clone());

        info!(
            node = %self.local_id,
            bootstrap = %bootstrap.node_id(),
            "Joining overlay"
        );
        out.send(bootstrap, Message::Route(route));
        Ok(token)
    }

    /// Declare this node the first member of a new overlay
    pub fn bootstrap_alone(&mut self, out: &mut Outbox) {
        info!(node = %self.local_id, "Starting a new overlay");
        self.set_join_state(JoinState::Ready, out);
        out.events.push(OverlayEvent::JoinCompleted {
            terminal: self.local_id,
        });
    }

    fn is_pending_token(&self, token: u64) -> bool {
        matches!(self.join, JoinState::Joining { token: pending } if pending == token)
    }

    /// Process a join request passing through this node
    pub(crate) fn join_hop(&mut self, mut route: RouteMessage, hop: NextHop, out: &mut Outbox) {
        let RoutedPayload::Join(request) = &mut route.payload else {
            return;
        };
        let origin = request.origin().clone();
        let origin_id = origin.node_id();

        // Rows from the first one still missing up to the joiner's prefix
        let last_row = self
            .local_id
            .index_of_msdd(&origin_id, self.config.digit_bits)
            .unwrap_or(self.routing_table.num_rows() - 1);
        for row in request.next_row()..=last_row {
            request.push_row(row, self.routing_table.row_snapshot(row));
        }

        match hop {
            NextHop::Local => {
                if origin_id == self.local_id && !self.is_pending_token(request.token()) {
                    self.stats.join_collisions += 1;
                    warn!(
                        node = %self.local_id,
                        "Rejecting join from a node claiming our identifier"
                    );
                    out.send(
                        origin,
                        Message::JoinRejected {
                            token: request.token(),
                            terminal: self.local.clone(),
                            reason: JoinRejection::IdCollision,
                        },
                    );
                    return;
                }

                request.accept(self.local.clone(), self.leaf_set.snapshot());
                self.stats.joins_accepted += 1;
                debug!(node = %self.local_id, joiner = %origin_id, "Accepting join");

                if let RoutedPayload::Join(request) = route.payload {
                    self.learn_route_entry(&origin);
                    out.send(origin, Message::JoinRequest(request));
                }
            }
            NextHop::Forward { handle, via } => {
                // The origin is learned from its row announcements once the
                // terminal has ruled out an identifier collision
                self.check_route_table_hole(&route, via, out);
                self.forward(route, handle, out);
            }
        }
    }

    fn learn_route_entry(&mut self, handle: &Handle) {
        if let Some(verified) = self.verified_live(handle) {
            self.routing_table.put(verified);
        }
    }

    /// Apply an accepted join request returned by its terminal node
    pub(crate) fn join_accepted(&mut self, request: JoinRequest, out: &mut Outbox) {
        if !self.is_pending_token(request.token()) {
            debug!(node = %self.local_id, "Ignoring stale join response");
            return;
        }
        let (Some(terminal), Some(leaf_set)) = (request.terminal(), request.leaf_set()) else {
            warn!(node = %self.local_id, "Join response was never accepted");
            return;
        };
        let terminal_id = terminal.node_id();

        if terminal_id != self.local_id {
            self.learn_route_entry(terminal);
        }

        self.receive_leaf_set(
            BroadcastLeafSet {
                from: terminal.clone(),
                leaf_set: leaf_set.clone(),
                kind: LeafSetKind::JoinInitial,
            },
            out,
        );

        for (_, row) in request.rows() {
            for handle in row.iter().flatten() {
                if handle.node_id() != self.local_id {
                    self.learn_route_entry(handle);
                }
            }
        }

        self.announce_route_rows(out);

        self.set_join_state(JoinState::Ready, out);
        out.events.push(OverlayEvent::JoinCompleted {
            terminal: terminal_id,
        });
        info!(
            node = %self.local_id,
            terminal = %terminal_id,
            leaf_set = self.leaf_set.size(),
            routes = self.routing_table.size(),
            "Joined overlay"
        );
    }

    /// Send each routing table row to the closest live node of every slot in it
    fn announce_route_rows(&mut self, out: &mut Outbox) {
        for row_index in 0..self.routing_table.num_rows() {
            let Some(slots) = self.routing_table.get_row(row_index) else {
                continue;
            };
            let targets: Vec<Handle> = slots
                .iter()
                .flatten()
                .filter_map(|set| set.closest_node().cloned())
                .collect();
            if targets.is_empty() {
                continue;
            }

            let row = self.routing_table.row_snapshot(row_index);
            for target in targets {
                out.send(
                    target,
                    Message::BroadcastRouteRow(BroadcastRouteRow {
                        from: self.local.clone(),
                        row_index,
                        row: row.clone(),
                    }),
                );
            }
        }
    }

    /// Handle the terminal node refusing our join
    pub(crate) fn join_rejected(&mut self, token: u64, terminal: &Handle, out: &mut Outbox) {
        if !self.is_pending_token(token) {
            debug!(node = %self.local_id, "Ignoring stale join rejection");
            return;
        }
        warn!(
            node = %self.local_id,
            terminal = %terminal.node_id(),
            "Join rejected: identifier already in use"
        );
        self.fail_join(JoinFailure::IdCollision, out);
    }

    pub(crate) fn fail_join(&mut self, reason: JoinFailure, out: &mut Outbox) {
        if !matches!(self.join, JoinState::Joining { .. }) {
            return;
        }
        self.set_join_state(JoinState::Failed(reason), out);
        out.events.push(OverlayEvent::JoinFailed { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{recording, state_for, stub, stub_node};
    use ringmesh_protocol::Id;

    fn join_route(out: &Outbox) -> RouteMessage {
        match &out.sends[0].1 {
            Message::Route(route) => route.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_initiate_join() {
        let mut joiner = state_for(stub(1005), 2);
        let mut out = Outbox::default();
        let token = joiner.initiate_join(&stub(1000), &mut out).unwrap();

        assert_eq!(joiner.join_state(), JoinState::Joining { token });
        assert_eq!(out.join_state, Some(JoinState::Joining { token }));
        assert_eq!(out.sends[0].0.node_id(), Id::from_u128(1000));

        let route = join_route(&out);
        assert_eq!(route.target, Id::from_u128(1005));
        assert!(matches!(route.payload, RoutedPayload::Join(_)));
    }

    #[test]
    fn test_initiate_join_dead_bootstrap() {
        let mut joiner = state_for(stub(1005), 2);
        let bootstrap = stub_node(1000);
        bootstrap.kill();
        let mut out = Outbox::default();
        let result = joiner.initiate_join(&(bootstrap as Handle), &mut out);
        assert!(matches!(result, Err(RoutingError::BootstrapUnreachable(_))));
        assert_eq!(joiner.join_state(), JoinState::Idle);
        assert!(out.sends.is_empty());
    }

    #[test]
    fn test_terminal_accepts_and_returns() {
        let mut terminal = state_for(stub(1000), 2);
        terminal.learn(&stub(990));
        terminal.learn(&stub(1010));

        let (joiner_handle, joiner_log) = recording(1004);
        let mut joiner = state_for(joiner_handle.clone(), 2);
        let mut out = Outbox::default();
        joiner.initiate_join(&stub(1000), &mut out).unwrap();
        let route = join_route(&out);

        let mut terminal_out = Outbox::default();
        terminal.route_message(route, &mut terminal_out);

        assert_eq!(terminal.stats().joins_accepted, 1);
        assert!(terminal.routing_table().get(&Id::from_u128(1004)).is_some());
        let (to, message) = &terminal_out.sends[0];
        assert_eq!(to.node_id(), Id::from_u128(1004));
        let Message::JoinRequest(request) = message else {
            panic!("expected a join response");
        };
        assert!(request.is_accepted());
        assert!(request.rows().count() > 0);
        assert!(joiner_log.lock().unwrap().is_empty());

        // Joiner applies the response
        let mut joiner_out = Outbox::default();
        joiner.join_accepted(request.clone(), &mut joiner_out);
        assert_eq!(joiner.join_state(), JoinState::Ready);
        assert!(joiner.leaf_set().member(&Id::from_u128(1000)));
        assert!(joiner.leaf_set().member(&Id::from_u128(1010)));
        assert!(joiner.leaf_set().member(&Id::from_u128(990)));
        assert!(joiner_out
            .events
            .contains(&OverlayEvent::JoinCompleted { terminal: Id::from_u128(1000) }));

        // Join-initial merge is followed by an advertisement to every member
        let advertised = joiner_out
            .sends
            .iter()
            .filter(|(_, m)| {
                matches!(m, Message::BroadcastLeafSet(b) if b.kind == LeafSetKind::JoinAdvertise)
            })
            .count();
        assert_eq!(advertised, 3);
    }

    #[test]
    fn test_collision_rejected() {
        let mut owner = state_for(stub(1000), 2);
        let mut out = Outbox::default();
        owner.bootstrap_alone(&mut out);

        let mut impostor = state_for(stub(1000), 2);
        let mut out = Outbox::default();
        let token = impostor.initiate_join(&stub(1000), &mut out).unwrap();
        let route = join_route(&out);

        let mut owner_out = Outbox::default();
        owner.route_message(route, &mut owner_out);
        assert_eq!(owner.stats().join_collisions, 1);

        let (_, message) = &owner_out.sends[0];
        let Message::JoinRejected { token: t, terminal, reason } = message else {
            panic!("expected a rejection");
        };
        assert_eq!(*t, token);
        assert_eq!(*reason, JoinRejection::IdCollision);

        let mut impostor_out = Outbox::default();
        impostor.join_rejected(*t, terminal, &mut impostor_out);
        assert_eq!(
            impostor.join_state(),
            JoinState::Failed(JoinFailure::IdCollision)
        );
        assert!(impostor_out.events.contains(&OverlayEvent::JoinFailed {
            reason: JoinFailure::IdCollision
        }));
    }

    #[test]
    fn test_forwarding_hop_does_not_learn_joiner() {
        let top = |d: u128| d << 124;
        let mut hop = state_for(stub(top(0x1)), 1);
        for d in [0x0, 0x2, 0x9] {
            hop.learn(&stub(top(d)));
        }

        let mut joiner = state_for(stub(top(0x9) + 5), 1);
        let mut out = Outbox::default();
        joiner.initiate_join(&stub(top(0x1)), &mut out).unwrap();
        let route = join_route(&out);

        let mut hop_out = Outbox::default();
        hop.route_message(route, &mut hop_out);

        let forwarded = hop_out.sends.iter().find_map(|(to, m)| match m {
            Message::Route(route) => Some((to.node_id(), route.clone())),
            _ => None,
        });
        let (to, route) = forwarded.expect("join request forwarded");
        assert_eq!(to, Id::from_u128(top(0x9)));
        let RoutedPayload::Join(request) = route.payload else {
            panic!("expected a join payload");
        };
        assert!(request.rows().count() > 0);

        assert!(hop.routing_table().get(&Id::from_u128(top(0x9) + 5)).is_none());
        assert!(!hop.leaf_set().member(&Id::from_u128(top(0x9) + 5)));
        assert_eq!(hop.stats().joins_accepted, 0);
    }

    #[test]
    fn test_stale_response_ignored() {
        let mut joiner = state_for(stub(1005), 2);
        let mut request = JoinRequest::new(stub(1005), 42, 32);
        request.accept(stub(1000), state_for(stub(1000), 2).leaf_set().snapshot());

        let mut out = Outbox::default();
        joiner.join_accepted(request, &mut out);
        assert_eq!(joiner.join_state(), JoinState::Idle);
        assert!(out.is_empty());
    }
}
