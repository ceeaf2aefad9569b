//! Leaf set: the nearest neighbours on either side of the local node
//!
//! Each side is ordered by *side distance* from the local identifier. A
//! candidate on the side's own half of the ring is measured by the short arc,
//! one on the opposite half by the long arc, so both sides keep filling on a
//! ring smaller than the leaf set.

use ringmesh_protocol::{Distance, Handle, Id, LeafSetSnapshot};

use crate::error::{DhtError, Result};
use crate::update::NodeSetUpdate;

/// One side of the leaf set
#[derive(Debug, Clone)]
struct Side {
    clockwise: bool,
    capacity: usize,
    /// Nearest first
    nodes: Vec<(Handle, Distance)>,
}

impl Side {
    fn new(clockwise: bool, capacity: usize) -> Self {
        Side {
            clockwise,
            capacity,
            nodes: Vec::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    fn side_distance(&self, base: &Id, id: &Id) -> Distance {
        if base.clockwise(id) == self.clockwise {
            base.distance(id)
        } else {
            base.long_distance(id)
        }
    }

    fn get(&self, index: usize) -> Option<&Handle> {
        self.nodes.get(index).map(|(h, _)| h)
    }

    fn index_of(&self, id: &Id) -> Option<usize> {
        self.nodes.iter().position(|(h, _)| h.node_id() == *id)
    }

    fn last(&self) -> Option<&Handle> {
        self.nodes.last().map(|(h, _)| h)
    }

    fn test(&self, base: &Id, id: &Id) -> bool {
        if *id == *base || self.index_of(id).is_some() {
            return false;
        }
        if !self.is_full() {
            return true;
        }
        match self.nodes.last() {
            Some((_, farthest)) => self.side_distance(base, id) < *farthest,
            None => false,
        }
    }

    /// Insert in order, returning the evicted entry on success
    fn put(&mut self, base: &Id, handle: &Handle) -> Option<Option<Handle>> {
        let id = handle.node_id();
        if !self.test(base, &id) {
            return None;
        }

        let distance = self.side_distance(base, &id);
        let evicted = if self.is_full() {
            self.nodes.pop().map(|(h, _)| h)
        } else {
            None
        };
        let pos = self.nodes.partition_point(|(_, d)| *d < distance);
        self.nodes.insert(pos, (handle.clone(), distance));
        Some(evicted)
    }

    fn remove(&mut self, id: &Id) -> Option<Handle> {
        let pos = self.index_of(id)?;
        Some(self.nodes.remove(pos).0)
    }

    /// Index of the entry nearest `key`, -1 meaning the local node
    ///
    /// Walks outward while the distance strictly shrinks.
    fn most_similar(&self, base: &Id, key: &Id) -> isize {
        let mut best = base.distance(key);
        let mut index = -1isize;
        for (i, (h, _)) in self.nodes.iter().enumerate() {
            let d = h.node_id().distance(key);
            if d >= best {
                break;
            }
            best = d;
            index = i as isize;
        }
        index
    }

    fn handles(&self) -> impl DoubleEndedIterator<Item = &Handle> + '_ {
        self.nodes.iter().map(|(h, _)| h)
    }
}

/// Leaf set of the local node
#[derive(Debug, Clone)]
pub struct LeafSet {
    local: Handle,
    local_node_id: Id,
    half_size: usize,
    cw: Side,
    ccw: Side,
    changes: Vec<NodeSetUpdate>,
}

impl LeafSet {
    /// Create an empty leaf set with `half_size` slots per side
    pub fn new(local: Handle, half_size: usize) -> Result<Self> {
        if half_size == 0 {
            return Err(DhtError::InvalidLeafSetSize(half_size));
        }
        Ok(LeafSet {
            local_node_id: local.node_id(),
            local,
            half_size,
            cw: Side::new(true, half_size),
            ccw: Side::new(false, half_size),
            changes: Vec::new(),
        })
    }

    /// Rebuild a leaf set from a broadcast snapshot
    pub fn from_snapshot(snapshot: &LeafSetSnapshot) -> Result<Self> {
        let mut leaf_set = LeafSet::new(snapshot.base.clone(), snapshot.half_size)?;
        for handle in snapshot.members() {
            leaf_set.put(handle.clone());
        }
        leaf_set.changes.clear();
        Ok(leaf_set)
    }

    pub fn local_node(&self) -> &Handle {
        &self.local
    }

    pub fn local_node_id(&self) -> &Id {
        &self.local_node_id
    }

    pub fn half_size(&self) -> usize {
        self.half_size
    }

    pub fn max_size(&self) -> usize {
        2 * self.half_size
    }

    pub fn cw_size(&self) -> usize {
        self.cw.len()
    }

    pub fn ccw_size(&self) -> usize {
        self.ccw.len()
    }

    /// Occupied slots on both sides
    ///
    /// A node counted on both sides of a small ring counts twice.
    pub fn size(&self) -> usize {
        self.cw.len() + self.ccw.len()
    }

    pub fn is_full(&self) -> bool {
        self.cw.is_full() && self.ccw.is_full()
    }

    /// Would `put` accept this handle
    pub fn test(&self, handle: &Handle) -> bool {
        let id = handle.node_id();
        if id == self.local_node_id || self.member(&id) {
            return false;
        }
        self.cw.test(&self.local_node_id, &id) || self.ccw.test(&self.local_node_id, &id)
    }

    /// Offer a handle to both sides
    ///
    /// Returns true if either side took it.
    pub fn put(&mut self, handle: Handle) -> bool {
        let id = handle.node_id();
        if id == self.local_node_id || self.member(&id) {
            return false;
        }

        let base = self.local_node_id;
        let cw = self.cw.put(&base, &handle);
        let ccw = self.ccw.put(&base, &handle);
        let added = cw.is_some() || ccw.is_some();

        for evicted in [cw, ccw].into_iter().flatten().flatten() {
            if !self.member(&evicted.node_id()) {
                self.changes.push(NodeSetUpdate::removed(evicted));
            }
        }
        if added {
            self.changes.push(NodeSetUpdate::added(handle));
        }
        added
    }

    /// Remove a member from both sides
    pub fn remove(&mut self, id: &Id) -> Option<Handle> {
        let cw = self.cw.remove(id);
        let ccw = self.ccw.remove(id);
        let removed = cw.or(ccw)?;
        self.changes.push(NodeSetUpdate::removed(removed.clone()));
        Some(removed)
    }

    /// Member at a signed index
    ///
    /// 0 is the local node, `+i` the i-th clockwise entry and `-i` the i-th
    /// counterclockwise entry.
    pub fn get(&self, index: isize) -> Option<&Handle> {
        match index {
            0 => Some(&self.local),
            i if i > 0 => self.cw.get(i as usize - 1),
            i => self.ccw.get(i.unsigned_abs() - 1),
        }
    }

    pub fn get_by_id(&self, id: &Id) -> Option<&Handle> {
        self.index_of(id).and_then(|i| self.get(i))
    }

    /// Signed index of a member, clockwise side first
    pub fn index_of(&self, id: &Id) -> Option<isize> {
        if *id == self.local_node_id {
            return Some(0);
        }
        if let Some(i) = self.cw.index_of(id) {
            return Some(i as isize + 1);
        }
        self.ccw.index_of(id).map(|i| -(i as isize) - 1)
    }

    /// True if `id` is a member (the local node is not)
    pub fn member(&self, id: &Id) -> bool {
        self.cw.index_of(id).is_some() || self.ccw.index_of(id).is_some()
    }

    /// Signed index of the entry numerically closest to `key`
    pub fn most_similar(&self, key: &Id) -> isize {
        let base = &self.local_node_id;
        let cw_ms;
        let ccw_ms;

        if base.clockwise(key) {
            cw_ms = self.cw.most_similar(base, key);
            if cw_ms < self.cw.len() as isize - 1 {
                return cw_ms + 1;
            }
            ccw_ms = self.ccw.most_similar(base, key);
        } else {
            ccw_ms = self.ccw.most_similar(base, key);
            if ccw_ms < self.ccw.len() as isize - 1 {
                return -ccw_ms - 1;
            }
            cw_ms = self.cw.most_similar(base, key);
        }

        let cw_id = self.side_id(&self.cw, cw_ms);
        let ccw_id = self.side_id(&self.ccw, ccw_ms);
        let cw_distance = cw_id.distance(key);
        let ccw_distance = ccw_id.distance(key);

        if cw_distance < ccw_distance || (cw_distance == ccw_distance && key.clockwise(&cw_id)) {
            cw_ms + 1
        } else {
            -ccw_ms - 1
        }
    }

    fn side_id(&self, side: &Side, index: isize) -> Id {
        usize::try_from(index)
            .ok()
            .and_then(|i| side.get(i))
            .map(|h| h.node_id())
            .unwrap_or(self.local_node_id)
    }

    /// True if the two sides share members, meaning the set spans the ring
    pub fn overlaps(&self) -> bool {
        let cw_edge = self.cw.last().map(|h| h.node_id());
        let ccw_edge = self.ccw.last().map(|h| h.node_id());
        cw_edge.is_some_and(|id| self.ccw.index_of(&id).is_some())
            || ccw_edge.is_some_and(|id| self.cw.index_of(&id).is_some())
    }

    /// True if `key` lies between the two edges of the set
    pub fn covers(&self, key: &Id) -> bool {
        if self.size() == 0 || self.overlaps() {
            return true;
        }
        let cw_edge = self.side_id(&self.cw, self.cw.len() as isize - 1);
        let ccw_edge = self.side_id(&self.ccw, self.ccw.len() as isize - 1);
        key.is_between(&ccw_edge, &cw_edge)
    }

    /// The `max` nodes nearest `key`, local node included
    ///
    /// Empty when the key lies outside the set's range.
    pub fn replica_set(&self, key: &Id, max: usize) -> Vec<Handle> {
        if max == 0 || !self.covers(key) {
            return Vec::new();
        }
        let mut candidates: Vec<Handle> = std::iter::once(self.local.clone())
            .chain(self.members())
            .collect();
        candidates.sort_by_key(|h| (h.node_id().distance(key), h.node_id()));
        candidates.truncate(max);
        candidates
    }

    /// Distinct members from the farthest counterclockwise to the farthest clockwise
    pub fn members(&self) -> Vec<Handle> {
        let mut out: Vec<Handle> = self.ccw.handles().rev().cloned().collect();
        for h in self.cw.handles() {
            if self.ccw.index_of(&h.node_id()).is_none() {
                out.push(h.clone());
            }
        }
        out
    }

    /// Copy of the set for broadcasting
    pub fn snapshot(&self) -> LeafSetSnapshot {
        LeafSetSnapshot {
            base: self.local.clone(),
            half_size: self.half_size,
            cw: self.cw.handles().cloned().collect(),
            ccw: self.ccw.handles().cloned().collect(),
        }
    }

    /// Remove members whose handles report dead
    pub fn remove_dead(&mut self) -> Vec<Handle> {
        let dead: Vec<Id> = self
            .members()
            .iter()
            .filter(|h| !h.is_alive())
            .map(|h| h.node_id())
            .collect();
        dead.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Take the membership changes recorded since the last drain
    pub fn drain_changes(&mut self) -> Vec<NodeSetUpdate> {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{handle, test_node};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn ids(handles: impl Iterator<Item = Handle>) -> Vec<u128> {
        handles.map(|h| h.node_id().as_u128()).collect()
    }

    fn cw_ids(ls: &LeafSet) -> Vec<u128> {
        ids((1..=ls.cw_size() as isize).filter_map(|i| ls.get(i).cloned()))
    }

    fn ccw_ids(ls: &LeafSet) -> Vec<u128> {
        ids((1..=ls.ccw_size() as isize).filter_map(|i| ls.get(-i).cloned()))
    }

    #[test]
    fn test_invalid_size() {
        assert!(matches!(
            LeafSet::new(handle(1), 0),
            Err(DhtError::InvalidLeafSetSize(0))
        ));
    }

    #[test]
    fn test_insertion_scenario() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        for id in [999, 1001, 1002, 998] {
            assert!(ls.put(handle(id)), "{} should be accepted", id);
        }
        assert!(!ls.put(handle(1003)));

        assert_eq!(cw_ids(&ls), vec![1001, 1002]);
        assert_eq!(ccw_ids(&ls), vec![999, 998]);
        assert_eq!(ls.size(), 4);
        assert_eq!(ls.max_size(), 4);
    }

    #[test]
    fn test_rejects_local_and_duplicates() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        assert!(!ls.put(handle(1000)));
        assert!(ls.put(handle(1001)));
        assert!(!ls.put(handle(1001)));
        assert!(!ls.member(&Id::from_u128(1000)));
        assert!(!ls.test(&handle(1001)));
    }

    #[test]
    fn test_small_ring_fills_both_sides() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        ls.put(handle(1001));
        ls.put(handle(999));

        // Each node sits on both sides of a three node ring
        assert_eq!(ls.cw_size(), 2);
        assert_eq!(ls.ccw_size(), 2);
        assert_eq!(ids(ls.members().into_iter()), vec![1001, 999]);
        assert!(ls.overlaps());
        assert!(ls.covers(&Id::from_u128(u128::MAX / 2)));
    }

    #[test]
    fn test_membership_changes() {
        let mut ls = LeafSet::new(handle(1000), 1).unwrap();
        ls.put(handle(1002));
        ls.drain_changes();

        // 1001 displaces 1002 on the clockwise side. 1002 stays on the
        // counterclockwise side as the long way round.
        ls.put(handle(1001));
        let changes = ls.drain_changes();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].added);

        // 999 takes the counterclockwise slot and 1002 leaves the set
        ls.put(handle(999));
        let changes = ls.drain_changes();
        assert_eq!(changes.len(), 2);
        assert!(!changes[0].added);
        assert_eq!(changes[0].handle.node_id(), Id::from_u128(1002));
        assert!(changes[1].added);

        assert!(ls.remove(&Id::from_u128(999)).is_some());
        let changes = ls.drain_changes();
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].added);
        assert!(ls.remove(&Id::from_u128(999)).is_none());
    }

    #[test]
    fn test_get_and_index_of() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        for id in [999, 1001, 1002, 998] {
            ls.put(handle(id));
        }
        assert_eq!(ls.get(0).unwrap().node_id(), Id::from_u128(1000));
        assert_eq!(ls.get(2).unwrap().node_id(), Id::from_u128(1002));
        assert_eq!(ls.get(-2).unwrap().node_id(), Id::from_u128(998));
        assert!(ls.get(3).is_none());
        assert!(ls.get(-3).is_none());

        assert_eq!(ls.index_of(&Id::from_u128(1001)), Some(1));
        assert_eq!(ls.index_of(&Id::from_u128(998)), Some(-2));
        assert_eq!(ls.index_of(&Id::from_u128(5)), None);
        assert!(ls.get_by_id(&Id::from_u128(999)).is_some());
        assert!(ls.get_by_id(&Id::from_u128(5)).is_none());
    }

    #[test]
    fn test_most_similar() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        for id in [990, 995, 1010, 1020] {
            ls.put(handle(id));
        }
        assert_eq!(ls.most_similar(&Id::from_u128(1000)), 0);
        assert_eq!(ls.most_similar(&Id::from_u128(1001)), 0);
        assert_eq!(ls.most_similar(&Id::from_u128(1009)), 1);
        assert_eq!(ls.most_similar(&Id::from_u128(1500)), 2);
        assert_eq!(ls.most_similar(&Id::from_u128(996)), -1);
        assert_eq!(ls.most_similar(&Id::from_u128(500)), -2);
    }

    #[test]
    fn test_most_similar_tie_prefers_clockwise() {
        let mut ls = LeafSet::new(handle(1000), 1).unwrap();
        ls.put(handle(1010));
        ls.put(handle(990));
        assert_eq!(cw_ids(&ls), vec![1010]);
        assert_eq!(ccw_ids(&ls), vec![990]);

        // Opposite 1000 the key is equally far from 1010 and 990, and 990 is
        // the one lying clockwise of it
        let key = Id::from_u128(1000 + (1u128 << 127));
        assert_eq!(ls.most_similar(&key), -1);

        // Within one side the nearer-in entry wins a tie
        assert_eq!(ls.most_similar(&Id::from_u128(1005)), 0);
    }

    #[test]
    fn test_covers_and_replica_set() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        for id in [990, 995, 1010, 1020] {
            ls.put(handle(id));
        }
        ls.put(handle(1_000_000));
        ls.put(handle(u128::MAX));

        assert!(!ls.overlaps());
        assert!(ls.covers(&Id::from_u128(1015)));
        assert!(!ls.covers(&Id::from_u128(5000)));

        let replicas = ids(ls.replica_set(&Id::from_u128(1008), 3).into_iter());
        assert_eq!(replicas, vec![1010, 1000, 1020]);
        assert!(ls.replica_set(&Id::from_u128(5000), 3).is_empty());
        assert!(ls.replica_set(&Id::from_u128(1008), 0).is_empty());
    }

    #[test]
    fn test_test_matches_put() {
        let mut ls = LeafSet::new(handle(1000), 1).unwrap();
        ls.put(handle(1001));
        ls.put(handle(999));
        assert!(!ls.test(&handle(1002)));
        assert!(!ls.put(handle(1002)));
        // Members are never offered twice
        assert!(!ls.test(&handle(1001)));
        assert_eq!(ls.test(&handle(1005)), ls.clone().put(handle(1005)));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        for id in [999, 1001, 1002, 998] {
            ls.put(handle(id));
        }
        let snapshot = ls.snapshot();
        assert_eq!(snapshot.half_size, 2);

        let copy = LeafSet::from_snapshot(&snapshot).unwrap();
        assert_eq!(cw_ids(&copy), vec![1001, 1002]);
        assert_eq!(ccw_ids(&copy), vec![999, 998]);
        assert_eq!(*copy.local_node_id(), Id::from_u128(1000));
    }

    #[test]
    fn test_members_run_counterclockwise_to_clockwise() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        for id in [1001, 999, 1002, 998] {
            ls.put(handle(id));
        }
        assert_eq!(ids(ls.members().into_iter()), vec![998, 999, 1001, 1002]);

        let snapshot = ls.snapshot();
        let from_snapshot: Vec<u128> = snapshot.members().map(|h| h.node_id().as_u128()).collect();
        assert_eq!(from_snapshot, vec![998, 999, 1001, 1002]);
    }

    #[test]
    fn test_remove_dead() {
        let mut ls = LeafSet::new(handle(1000), 2).unwrap();
        let dead = test_node(1001, 1);
        ls.put(dead.clone());
        ls.put(handle(999));
        dead.kill();

        let removed = ls.remove_dead();
        assert_eq!(removed.len(), 1);
        assert!(!ls.member(&Id::from_u128(1001)));
        assert!(ls.member(&Id::from_u128(999)));
    }

    #[test]
    fn test_bounded_and_ordered() {
        let mut rng = StdRng::seed_from_u64(7);
        let local = Id::random(&mut rng);
        let mut ls = LeafSet::new(handle(local.as_u128()), 4).unwrap();

        for _ in 0..300 {
            let id: u128 = rng.gen();
            ls.put(handle(id));

            assert!(ls.cw_size() <= 4 && ls.ccw_size() <= 4);
            assert!(!ls.member(&local));

            for (sign, clockwise) in [(1isize, true), (-1, false)] {
                let size = if clockwise { ls.cw_size() } else { ls.ccw_size() };
                let side: Vec<Distance> = (1..=size as isize)
                    .map(|i| ls.get(sign * i).unwrap().node_id())
                    .map(|id| {
                        if local.clockwise(&id) == clockwise {
                            local.distance(&id)
                        } else {
                            local.long_distance(&id)
                        }
                    })
                    .collect();
                assert!(side.windows(2).all(|p| p[0] < p[1]));
            }
        }

        // Once full, both sides hold only their own half of the ring
        assert!(ls.is_full());
        for i in 1..=4 {
            assert!(local.clockwise(&ls.get(i).unwrap().node_id()));
            assert!(!local.clockwise(&ls.get(-i).unwrap().node_id()));
        }
    }
}
