//! Routing table row exchange and repair

use ringmesh_protocol::{BroadcastRouteRow, Handle, Message};
use tracing::{debug, warn};

use crate::error::{Result, RoutingError};
use crate::state::{Outbox, RoutingState};

impl RoutingState {
    /// Insert the sender and every live handle of a broadcast row
    pub(crate) fn receive_route_row(&mut self, broadcast: BroadcastRouteRow) {
        let mut candidates: Vec<Handle> = vec![broadcast.from];
        candidates.extend(broadcast.row.into_iter().flatten());

        for handle in candidates {
            if handle.node_id() == self.local_id {
                continue;
            }
            if let Some(verified) = self.verified_live(&handle) {
                self.routing_table.put(verified);
            }
        }
    }

    /// Answer a request for one of our rows
    pub(crate) fn route_row_requested(
        &mut self,
        from: &Handle,
        row_index: usize,
        out: &mut Outbox,
    ) -> Result<()> {
        if row_index >= self.routing_table.num_rows() {
            self.stats.protocol_violations += 1;
            warn!(
                node = %self.local_id,
                peer = %from.node_id(),
                row = row_index,
                "Route row request out of range"
            );
            return Err(RoutingError::ProtocolViolation(format!(
                "row {} requested from a table of {} rows",
                row_index,
                self.routing_table.num_rows()
            )));
        }

        if let Some(from) = self.verified_live(from) {
            out.send(
                from,
                Message::BroadcastRouteRow(BroadcastRouteRow {
                    from: self.local.clone(),
                    row_index,
                    row: self.routing_table.row_snapshot(row_index),
                }),
            );
        }
        Ok(())
    }

    /// Prune dead entries and refresh every populated row from a random member
    pub(crate) fn maintain_route_table(&mut self, out: &mut Outbox) {
        let pruned = self.routing_table.prune_dead();
        if pruned > 0 {
            debug!(node = %self.local_id, pruned, "Pruned dead routing table entries");
        }

        for row in 0..self.routing_table.num_rows() {
            let member = self.routing_table.random_live_in_row(row, &mut self.rng);
            if let Some(member) = member {
                out.send(
                    member,
                    Message::RequestRouteRow {
                        from: self.local.clone(),
                        row,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{state_for, stub, stub_node};
    use ringmesh_protocol::Id;

    const fn top(d: u128) -> u128 {
        d << 124
    }

    #[test]
    fn test_receive_route_row() {
        let mut state = state_for(stub(top(0x1)), 2);
        let dead = stub_node(top(0x4));
        let row = vec![vec![stub(top(0x3))], vec![dead.clone() as Handle], vec![stub(top(0x1))]];
        dead.kill();

        state.receive_route_row(BroadcastRouteRow {
            from: stub(top(0x7)),
            row_index: 0,
            row,
        });

        let rt = state.routing_table();
        assert!(rt.get(&Id::from_u128(top(0x7))).is_some());
        assert!(rt.get(&Id::from_u128(top(0x3))).is_some());
        assert!(rt.get(&Id::from_u128(top(0x4))).is_none());
        assert_eq!(rt.size(), 2);
    }

    #[test]
    fn test_route_row_requested() {
        let mut state = state_for(stub(top(0x1)), 2);
        state.learn(&stub(top(0x5)));

        let mut out = Outbox::default();
        state.route_row_requested(&stub(top(0x9)), 0, &mut out).unwrap();
        let Message::BroadcastRouteRow(reply) = &out.sends[0].1 else {
            panic!("expected a row");
        };
        assert_eq!(reply.row_index, 0);
        assert_eq!(reply.row[5].len(), 1);

        let result = state.route_row_requested(&stub(top(0x9)), 500, &mut out);
        assert!(matches!(result, Err(RoutingError::ProtocolViolation(_))));
        assert_eq!(out.sends.len(), 1);
    }

    #[test]
    fn test_maintenance_prunes_and_requests() {
        let mut state = state_for(stub(top(0x1)), 2);
        let dead = stub_node(top(0x4));
        state.learn(&(dead.clone() as Handle));
        state.learn(&stub(top(0x8)));
        state.learn(&stub(top(0x1) + 5));
        dead.kill();

        let mut out = Outbox::default();
        state.maintain_route_table(&mut out);

        assert!(state.routing_table().get(&Id::from_u128(top(0x4))).is_none());
        // Row 0 holds 0x8..., the deepest row holds the near neighbour
        assert_eq!(out.sends.len(), 2);
        assert!(out
            .sends
            .iter()
            .all(|(_, m)| matches!(m, Message::RequestRouteRow { .. })));
    }
}
