//! Route sets held in routing table slots

use ringmesh_protocol::{Handle, Id, PROXIMITY_UNKNOWN};

/// Outcome of offering a handle to a route set
#[derive(Debug, Clone)]
pub enum RouteSetPut {
    /// Appended to a set with room left
    Added,
    /// Displaced a farther entry
    Replaced(Handle),
    /// Duplicate, unmeasured, or not nearer than the current entries
    Rejected,
}

impl RouteSetPut {
    pub fn is_inserted(&self) -> bool {
        !matches!(self, RouteSetPut::Rejected)
    }
}

/// Bounded set of handles sharing one routing table slot
///
/// When full, an entry is only displaced by a candidate with strictly lower
/// proximity.
#[derive(Debug, Clone)]
pub struct RouteSet {
    nodes: Vec<Handle>,
    capacity: usize,
}

impl RouteSet {
    /// Create an empty route set holding up to `capacity` handles
    pub fn new(capacity: usize) -> Self {
        RouteSet {
            nodes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn nodes(&self) -> &[Handle] {
        &self.nodes
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.find_node(id).is_some()
    }

    pub fn find_node(&self, id: &Id) -> Option<&Handle> {
        self.nodes.iter().find(|h| h.node_id() == *id)
    }

    /// Offer a handle to the set
    pub fn put(&mut self, handle: Handle) -> RouteSetPut {
        let id = handle.node_id();
        if self.contains(&id) {
            return RouteSetPut::Rejected;
        }

        if !self.is_full() {
            self.nodes.push(handle);
            return RouteSetPut::Added;
        }

        let proximity = handle.proximity();
        if proximity == PROXIMITY_UNKNOWN {
            return RouteSetPut::Rejected;
        }

        let worst = self
            .nodes
            .iter()
            .enumerate()
            .max_by_key(|(_, h)| h.proximity())
            .map(|(i, h)| (i, h.proximity()));

        match worst {
            Some((index, worst_proximity)) if proximity < worst_proximity => {
                let evicted = std::mem::replace(&mut self.nodes[index], handle);
                RouteSetPut::Replaced(evicted)
            }
            _ => RouteSetPut::Rejected,
        }
    }

    /// Remove a node by identifier
    pub fn remove(&mut self, id: &Id) -> Option<Handle> {
        let pos = self.nodes.iter().position(|h| h.node_id() == *id)?;
        Some(self.nodes.remove(pos))
    }

    /// Live entry with the lowest proximity
    pub fn closest_node(&self) -> Option<&Handle> {
        self.nodes
            .iter()
            .filter(|h| h.is_alive())
            .min_by_key(|h| h.proximity())
    }

    /// Remove entries whose handles report dead
    pub fn prune_dead(&mut self) -> Vec<Handle> {
        let mut dead = Vec::new();
        self.nodes.retain(|h| {
            if h.is_alive() {
                true
            } else {
                dead.push(h.clone());
                false
            }
        });
        dead
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handle> {
        self.nodes.iter()
    }
}
