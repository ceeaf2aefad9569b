//! Membership change records

use ringmesh_protocol::Handle;

/// A handle entering or leaving a node set
#[derive(Debug, Clone)]
pub struct NodeSetUpdate {
    pub handle: Handle,
    pub added: bool,
}

impl NodeSetUpdate {
    pub fn added(handle: Handle) -> Self {
        NodeSetUpdate {
            handle,
            added: true,
        }
    }

    pub fn removed(handle: Handle) -> Self {
        NodeSetUpdate {
            handle,
            added: false,
        }
    }
}
