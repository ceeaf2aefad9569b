//! RingMesh DHT routing state
//!
//! This module holds the two structures a node routes with:
//! - The leaf set of numerically nearest neighbours on each side
//! - The prefix routing table of route sets, one per (row, digit) slot
//!
//! Both record membership changes for the owning node to drain.

pub mod error;
pub mod leaf_set;
pub mod route_set;
pub mod routing_table;
pub mod update;

#[cfg(test)]
mod test_util;

pub use error::{DhtError, Result};
pub use leaf_set::LeafSet;
pub use route_set::{RouteSet, RouteSetPut};
pub use routing_table::RoutingTable;
pub use update::NodeSetUpdate;

/// Default number of leaf set entries on each side
pub const DEFAULT_LEAF_SET_HALF_SIZE: usize = 8;

/// Default bits per routing digit
pub const DEFAULT_DIGIT_BITS: u32 = 4;

/// Default number of handles per routing table slot
pub const DEFAULT_ROUTE_SET_SIZE: usize = 1;
