//! Key-based routing decisions
//!
//! A route message is evaluated at every node it visits: either this node is
//! the numerically closest one it knows of and the payload is delivered here,
//! or the message is handed to a node that is closer in prefix or in value.

use ringmesh_protocol::{Handle, Id, Message, RouteMessage, RoutedPayload};
use tracing::{debug, warn};

use crate::error::{Result, RoutingError};
use crate::state::{Delivery, Outbox, RoutingState};

/// Where a next hop came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopSource {
    LeafSet,
    RouteTable,
    AlternateRoute,
    /// Leaf set member used when the key lies beyond the leaf set
    LeafSetFallback,
}

/// Digits `a` shares with `key`, all of them when equal
pub fn shared_prefix(a: &Id, key: &Id, digit_bits: u32) -> usize {
    a.index_of_msdd(key, digit_bits)
        .unwrap_or_else(|| Id::num_digits(digit_bits))
}

/// Result of one routing decision
#[derive(Debug, Clone)]
pub enum NextHop {
    /// This node is the destination
    Local,
    Forward { handle: Handle, via: HopSource },
}

impl NextHop {
    pub fn is_local(&self) -> bool {
        matches!(self, NextHop::Local)
    }
}

impl RoutingState {
    /// Accept a message destined for the router
    ///
    /// Only route messages are valid here. Anything else is a protocol
    /// violation: it is dropped and reported, and the node carries on.
    pub fn receive_message(&mut self, message: Message, out: &mut Outbox) -> Result<()> {
        match message {
            Message::Route(route) => {
                self.route_message(route, out);
                Ok(())
            }
            other => {
                self.stats.protocol_violations += 1;
                warn!(
                    node = %self.local_id,
                    kind = other.kind(),
                    "Router received a message it cannot route"
                );
                Err(RoutingError::ProtocolViolation(format!(
                    "router cannot handle {} messages",
                    other.kind()
                )))
            }
        }
    }

    /// Choose the next hop for `key`
    ///
    /// Dead leaf set entries met on the way are removed and the decision is
    /// taken again, at most once per leaf set slot.
    pub fn next_hop(&mut self, key: &Id) -> NextHop {
        let attempts = self.leaf_set.max_size() + 1;

        for _ in 0..attempts {
            let ls_pos = self.leaf_set.most_similar(key);
            if ls_pos == 0 {
                return NextHop::Local;
            }

            let cw_size = self.leaf_set.cw_size() as isize;
            let ccw_size = self.leaf_set.ccw_size() as isize;
            let Some(candidate) = self.leaf_set.get(ls_pos).cloned() else {
                return NextHop::Local;
            };

            // Inside the populated range: not the edge entry, or the key is
            // not beyond the edge
            let key_clockwise = candidate.node_id().clockwise(key);
            let in_range = if ls_pos > 0 {
                ls_pos < cw_size || !key_clockwise
            } else {
                -ls_pos < ccw_size || key_clockwise
            };

            if in_range {
                if candidate.is_alive() {
                    return NextHop::Forward {
                        handle: candidate,
                        via: HopSource::LeafSet,
                    };
                }
                self.remove_dead_leaf(&candidate);
                continue;
            }

            if let Some(handle) = self
                .routing_table
                .get_best_entry(key)
                .and_then(|set| set.closest_node())
                .cloned()
            {
                return NextHop::Forward {
                    handle,
                    via: HopSource::RouteTable,
                };
            }

            let edge_index = if ls_pos > 0 { cw_size } else { -ccw_size };
            if let Some(edge) = self.leaf_set.get(edge_index).cloned() {
                if edge.node_id() != self.local_id && !edge.is_alive() {
                    self.remove_dead_leaf(&edge);
                    continue;
                }
            }

            return match self.fallback_hop(key) {
                Some((handle, via)) => NextHop::Forward { handle, via },
                None => NextHop::Local,
            };
        }

        // Every leaf set entry turned out dead
        NextHop::Local
    }

    fn remove_dead_leaf(&mut self, handle: &Handle) {
        debug!(
            node = %self.local_id,
            dead = %handle.node_id(),
            "Removing dead leaf set member"
        );
        self.leaf_set.remove(&handle.node_id());
        self.stats.dead_leaves_removed += 1;
    }

    /// Closest live node that keeps our shared prefix with `key` and is
    /// numerically nearer to it than we are
    ///
    /// Only used when the routing table has no entry for the key's slot.
    /// Requiring both keeps every path finite.
    fn fallback_hop(&self, key: &Id) -> Option<(Handle, HopSource)> {
        let bits = self.config.digit_bits;
        let local_prefix = shared_prefix(&self.local_id, key, bits);
        let local_distance = self.local_id.distance(key);

        let alternate = self
            .routing_table
            .best_alternate_route(key)
            .map(|h| (h, HopSource::AlternateRoute));
        let leaves = self
            .leaf_set
            .members()
            .into_iter()
            .map(|h| (h, HopSource::LeafSetFallback));

        alternate
            .into_iter()
            .chain(leaves)
            .filter(|(h, _)| {
                let id = h.node_id();
                h.is_alive()
                    && shared_prefix(&id, key, bits) >= local_prefix
                    && id.distance(key) < local_distance
            })
            .min_by_key(|(h, _)| h.node_id().distance(key))
    }

    /// Route a message one hop further, or deliver it here
    pub(crate) fn route_message(&mut self, route: RouteMessage, out: &mut Outbox) {
        if let Err(e) = self.verifier.verify_credentials(&route.credentials) {
            self.stats.messages_dropped += 1;
            warn!(node = %self.local_id, error = %e, "Dropping message with bad credentials");
            return;
        }

        let max_hops = self.config.max_hops();
        if route.hops >= max_hops {
            self.stats.messages_dropped += 1;
            warn!(
                node = %self.local_id,
                key = %route.target,
                hops = route.hops,
                max_hops,
                "Dropping message that exceeded the hop limit"
            );
            return;
        }

        let hop = self.next_hop(&route.target);

        if matches!(route.payload, RoutedPayload::Join(_)) {
            self.join_hop(route, hop, out);
            return;
        }

        match hop {
            NextHop::Local => {
                if let RoutedPayload::App(app) = route.payload {
                    self.stats.messages_delivered += 1;
                    out.deliveries.push(Delivery {
                        tag: app.tag,
                        key: route.target,
                        source: route.source,
                        body: app.body,
                        hops: route.hops,
                    });
                }
            }
            NextHop::Forward { handle, via } => {
                self.check_route_table_hole(&route, via, out);
                self.forward(route, handle, out);
            }
        }
    }

    /// Hand the message to the next hop
    pub(crate) fn forward(&mut self, mut route: RouteMessage, next: Handle, out: &mut Outbox) {
        route.prev_hop = Some(self.local.clone());
        route.hops += 1;
        self.stats.messages_forwarded += 1;
        out.send(next, Message::Route(route));
    }

    /// Send our row to a previous hop that had to fall back on us
    ///
    /// If the previous hop shares as long a prefix with the key as we do, it
    /// had no entry for the slot we just used from our table.
    pub(crate) fn check_route_table_hole(
        &mut self,
        route: &RouteMessage,
        via: HopSource,
        out: &mut Outbox,
    ) {
        if via != HopSource::RouteTable {
            return;
        }
        let Some(prev) = route.prev_hop.as_ref() else {
            return;
        };
        let bits = self.config.digit_bits;
        let prev_id = prev.node_id();
        if prev_id == self.local_id {
            return;
        }
        let Some(row) = self.local_id.index_of_msdd(&route.target, bits) else {
            return;
        };
        if prev_id.index_of_msdd(&route.target, bits) != Some(row) {
            return;
        }
        let Some(prev) = self.verified_live(prev) else {
            return;
        };

        self.stats.hole_repairs += 1;
        debug!(node = %self.local_id, peer = %prev_id, row, "Filling route table hole");
        out.send(
            prev,
            Message::BroadcastRouteRow(ringmesh_protocol::BroadcastRouteRow {
                from: self.local.clone(),
                row_index: row,
                row: self.routing_table.row_snapshot(row),
            }),
        );
    }
}
