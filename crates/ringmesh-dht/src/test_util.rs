//! Handles for unit tests

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ringmesh_protocol::{Handle, Id, Message, NodeHandle, PROXIMITY_UNKNOWN};

#[derive(Debug)]
pub struct TestHandle {
    id: Id,
    alive: AtomicBool,
    proximity: AtomicU32,
}

impl TestHandle {
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl NodeHandle for TestHandle {
    fn node_id(&self) -> Id {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn proximity(&self) -> u32 {
        self.proximity.load(Ordering::SeqCst)
    }

    fn deliver(&self, _message: Message) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn test_node(id: u128, proximity: u32) -> Arc<TestHandle> {
    Arc::new(TestHandle {
        id: Id::from_u128(id),
        alive: AtomicBool::new(true),
        proximity: AtomicU32::new(proximity),
    })
}

pub fn handle(id: u128) -> Handle {
    test_node(id, PROXIMITY_UNKNOWN)
}

pub fn handle_with_proximity(id: u128, proximity: u32) -> Handle {
    test_node(id, proximity)
}

/// Identifier whose leading bits are `prefix`
pub fn top(prefix: u128, bits: u32) -> u128 {
    prefix << (128 - bits)
}
