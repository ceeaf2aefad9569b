//! Handles and states for unit tests

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ringmesh_protocol::{Handle, Id, Message, NodeHandle};

use crate::config::OverlayConfig;
use crate::security::PermissiveVerifier;
use crate::state::RoutingState;

pub type MessageLog = Arc<Mutex<Vec<Message>>>;

#[derive(Debug)]
pub struct StubHandle {
    id: Id,
    alive: AtomicBool,
    log: MessageLog,
}

impl StubHandle {
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl NodeHandle for StubHandle {
    fn node_id(&self) -> Id {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn proximity(&self) -> u32 {
        1
    }

    fn deliver(&self, message: Message) {
        self.log.lock().unwrap().push(message);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn stub_node(id: u128) -> Arc<StubHandle> {
    Arc::new(StubHandle {
        id: Id::from_u128(id),
        alive: AtomicBool::new(true),
        log: Arc::default(),
    })
}

pub fn stub(id: u128) -> Handle {
    stub_node(id)
}

/// Live handle recording what is delivered to it
pub fn recording(id: u128) -> (Handle, MessageLog) {
    let node = stub_node(id);
    let log = node.log.clone();
    (node as Handle, log)
}

pub fn state_for(local: Handle, half_size: usize) -> RoutingState {
    let config = OverlayConfig {
        leaf_set_half_size: half_size,
        ..Default::default()
    };
    RoutingState::new(local, config, Arc::new(PermissiveVerifier)).unwrap()
}
