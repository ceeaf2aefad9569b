#![no_main]

use std::any::Any;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use ringmesh_dht::{LeafSet, RoutingTable};
use ringmesh_protocol::{Handle, Id, Message, NodeHandle};

#[derive(Debug)]
struct FuzzHandle {
    id: Id,
    alive: bool,
    proximity: u32,
}

impl NodeHandle for FuzzHandle {
    fn node_id(&self) -> Id {
        self.id
    }
    fn is_alive(&self) -> bool {
        self.alive
    }
    fn proximity(&self) -> u32 {
        self.proximity
    }
    fn deliver(&self, _message: Message) {}
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn handle_from(chunk: &[u8]) -> Handle {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&chunk[..16]);
    Arc::new(FuzzHandle {
        id: Id::from_bytes(bytes),
        alive: chunk[16] & 1 == 0,
        proximity: u32::from(chunk[17]),
    })
}

fuzz_target!(|data: &[u8]| {
    // Routing state must never panic whatever identifiers it is fed
    if data.len() < 2 {
        return;
    }
    let digit_bits = u32::from(data[0] % 8) + 1;
    let half_size = usize::from(data[1] % 8) + 1;
    let rest = &data[2..];

    let local = Arc::new(FuzzHandle {
        id: Id::from_u128(0x5555_5555_5555_5555_5555_5555_5555_5555),
        alive: true,
        proximity: 0,
    });
    let Ok(mut table) = RoutingTable::new(local.clone(), digit_bits, 2) else {
        return;
    };
    let Ok(mut leaf_set) = LeafSet::new(local, half_size) else {
        return;
    };

    for chunk in rest.chunks_exact(18) {
        let handle = handle_from(chunk);
        let key = handle.node_id();
        table.put(handle.clone());
        leaf_set.put(handle);

        let _ = table.get_best_entry(&key);
        let _ = table.best_alternate_route(&key);
        let index = leaf_set.most_similar(&key);
        let _ = leaf_set.get(index);
        let _ = leaf_set.replica_set(&key, 3);
    }

    table.prune_dead();
    leaf_set.remove_dead();
});
