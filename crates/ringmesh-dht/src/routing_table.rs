//! Prefix routing table

use rand::seq::SliceRandom;
use rand::Rng;
use ringmesh_protocol::types::check_digit_bits;
use ringmesh_protocol::{Handle, Id, RouteRow};

use crate::error::{DhtError, Result};
use crate::route_set::{RouteSet, RouteSetPut};
use crate::update::NodeSetUpdate;

/// Prefix routing table
///
/// Row `r` holds handles sharing exactly `r` leading digits with the local
/// identifier, slotted by their digit at position `r`. The slot matching the
/// local digit of each row stays empty.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Our local node
    local: Handle,

    /// Cached identifier of the local node
    local_node_id: Id,

    /// Bits per digit
    digit_bits: u32,

    /// Capacity of each route set
    route_set_size: usize,

    /// `num_rows` rows of `2^digit_bits` optional slots
    rows: Vec<Vec<Option<RouteSet>>>,

    /// Total handles in the table
    node_count: usize,

    /// Membership changes not yet drained
    changes: Vec<NodeSetUpdate>,
}

impl RoutingTable {
    /// Create an empty routing table for `local`
    pub fn new(local: Handle, digit_bits: u32, route_set_size: usize) -> Result<Self> {
        if check_digit_bits(digit_bits).is_err() {
            return Err(DhtError::InvalidDigitWidth(digit_bits));
        }
        if route_set_size == 0 {
            return Err(DhtError::InvalidRouteSetSize(route_set_size));
        }

        let num_rows = Id::num_digits(digit_bits);
        let num_columns = 1usize << digit_bits;
        let rows = (0..num_rows)
            .map(|_| (0..num_columns).map(|_| None).collect())
            .collect();

        Ok(RoutingTable {
            local_node_id: local.node_id(),
            local,
            digit_bits,
            route_set_size,
            rows,
            node_count: 0,
            changes: Vec::new(),
        })
    }

    pub fn local_node(&self) -> &Handle {
        &self.local
    }

    pub fn local_node_id(&self) -> &Id {
        &self.local_node_id
    }

    pub fn digit_bits(&self) -> u32 {
        self.digit_bits
    }

    pub fn route_set_size(&self) -> usize {
        self.route_set_size
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        1usize << self.digit_bits
    }

    /// Total number of handles in the table
    pub fn size(&self) -> usize {
        self.node_count
    }

    pub fn is_empty(&self) -> bool {
        self.node_count == 0
    }

    /// Row and slot an identifier belongs to
    ///
    /// `None` for the local identifier.
    pub fn coordinates(&self, id: &Id) -> Option<(usize, usize)> {
        let row = self.local_node_id.index_of_msdd(id, self.digit_bits)?;
        Some((row, id.digit(row, self.digit_bits)))
    }

    /// Offer a handle to the table
    ///
    /// Returns true if the handle was inserted.
    pub fn put(&mut self, handle: Handle) -> bool {
        let Some((row, slot)) = self.coordinates(&handle.node_id()) else {
            return false;
        };

        let capacity = self.route_set_size;
        let set = self.rows[row][slot].get_or_insert_with(|| RouteSet::new(capacity));

        match set.put(handle.clone()) {
            RouteSetPut::Added => {
                self.node_count += 1;
                self.changes.push(NodeSetUpdate::added(handle));
                true
            }
            RouteSetPut::Replaced(evicted) => {
                self.changes.push(NodeSetUpdate::removed(evicted));
                self.changes.push(NodeSetUpdate::added(handle));
                true
            }
            RouteSetPut::Rejected => false,
        }
    }

    /// Look up a handle by identifier
    pub fn get(&self, id: &Id) -> Option<&Handle> {
        let (row, slot) = self.coordinates(id)?;
        self.rows[row][slot].as_ref()?.find_node(id)
    }

    /// Remove a handle by identifier
    pub fn remove(&mut self, id: &Id) -> Option<Handle> {
        let (row, slot) = self.coordinates(id)?;
        let removed = self.rows[row][slot].as_mut()?.remove(id)?;
        self.node_count -= 1;
        self.changes.push(NodeSetUpdate::removed(removed.clone()));
        Some(removed)
    }

    /// Slots of row `row`
    pub fn get_row(&self, row: usize) -> Option<&[Option<RouteSet>]> {
        self.rows.get(row).map(|r| r.as_slice())
    }

    pub fn get_route_set(&self, row: usize, slot: usize) -> Option<&RouteSet> {
        self.rows.get(row)?.get(slot)?.as_ref()
    }

    /// Copy of row `row` for broadcasting
    pub fn row_snapshot(&self, row: usize) -> RouteRow {
        match self.rows.get(row) {
            Some(slots) => slots
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .map(|set| set.nodes().to_vec())
                        .unwrap_or_default()
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Route set for the slot one digit further along the key's prefix
    pub fn get_best_entry(&self, key: &Id) -> Option<&RouteSet> {
        let (row, slot) = self.coordinates(key)?;
        self.rows[row][slot].as_ref()
    }

    /// Live handle in the key's row numerically closer to the key than we are
    ///
    /// Slots are searched outward from the key digit, stopping once the local
    /// digit is reached.
    pub fn best_alternate_route(&self, key: &Id) -> Option<Handle> {
        let row = self.local_node_id.index_of_msdd(key, self.digit_bits)?;
        let columns = self.num_columns();
        let mask = columns - 1;
        let key_digit = key.digit(row, self.digit_bits);
        let my_digit = self.local_node_id.digit(row, self.digit_bits);

        let mut best_distance = self.local_node_id.distance(key);
        let mut best = None;

        for i in 1..=columns {
            let mut finished = false;
            for digit in [(key_digit + i) & mask, (key_digit + columns - i) & mask] {
                if let Some(set) = &self.rows[row][digit] {
                    for handle in set.iter().filter(|h| h.is_alive()) {
                        let d = handle.node_id().distance(key);
                        if d < best_distance {
                            best_distance = d;
                            best = Some(handle.clone());
                        }
                    }
                }
                if digit == my_digit {
                    finished = true;
                }
            }
            if finished {
                break;
            }
        }

        best
    }

    /// Up to `max` live handles in the key's row closer to the key than we are
    pub fn alternate_routes(&self, key: &Id, max: usize) -> Vec<Handle> {
        let Some(row) = self.local_node_id.index_of_msdd(key, self.digit_bits) else {
            return Vec::new();
        };
        let local_distance = self.local_node_id.distance(key);

        let mut found: Vec<Handle> = self.rows[row]
            .iter()
            .flatten()
            .flat_map(|set| set.iter())
            .filter(|h| h.is_alive() && h.node_id().distance(key) < local_distance)
            .cloned()
            .collect();

        found.sort_by_key(|h| h.node_id().distance(key));
        found.truncate(max);
        found
    }

    /// Every handle in the table
    pub fn handles(&self) -> impl Iterator<Item = &Handle> {
        self.rows
            .iter()
            .flat_map(|row| row.iter().flatten())
            .flat_map(|set| set.iter())
    }

    /// Random live handle from row `row`
    pub fn random_live_in_row<R: Rng + ?Sized>(&self, row: usize, rng: &mut R) -> Option<Handle> {
        let live: Vec<&Handle> = self
            .rows
            .get(row)?
            .iter()
            .flatten()
            .flat_map(|set| set.iter())
            .filter(|h| h.is_alive())
            .collect();
        live.choose(rng).map(|h| (*h).clone())
    }

    /// Remove every handle that reports dead
    ///
    /// Returns the number of handles removed.
    pub fn prune_dead(&mut self) -> usize {
        let mut removed = 0;
        for set in self.rows.iter_mut().flat_map(|row| row.iter_mut().flatten()) {
            for dead in set.prune_dead() {
                removed += 1;
                self.changes.push(NodeSetUpdate::removed(dead));
            }
        }
        self.node_count -= removed;
        removed
    }

    /// Take the membership changes recorded since the last drain
    pub fn drain_changes(&mut self) -> Vec<NodeSetUpdate> {
        std::mem::take(&mut self.changes)
    }
}
