//! In-process direct network
//!
//! Connects overlay nodes living in the same process. Each delivery runs the
//! receiving node's handler on its own task. Liveness is switched off by
//! [`DirectNetwork::kill`], and proximity comes from a simple topology model.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ringmesh_protocol::{Credentials, Handle, Id, Message, NodeHandle, PROXIMITY_UNKNOWN};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::OverlayConfig;
use crate::error::Result;
use crate::node::OverlayNode;
use crate::security::{Verifier, VerifyError};

/// Side length of the square nodes are scattered over
const PLANE_SIZE: f64 = 1000.0;

/// Transport address of a node on the direct network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr#{}", self.0)
    }
}

/// Proximity model between nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Every pair of distinct nodes is equally near
    Uniform,
    /// Nodes sit at random points of a plane
    #[default]
    Euclidean,
}

struct Peer {
    node: Arc<OverlayNode>,
    alive: AtomicBool,
    position: (f64, f64),
}

struct NetworkInner {
    peers: DashMap<Address, Arc<Peer>>,
    next_address: AtomicU64,
    in_flight: AtomicUsize,
    delivered: AtomicU64,
    topology: Topology,
    rng: Mutex<StdRng>,
}

impl NetworkInner {
    fn peer(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.get(&address).map(|p| p.value().clone())
    }

    fn proximity(&self, from: Address, to: Address) -> u32 {
        if from == to {
            return 0;
        }
        match self.topology {
            Topology::Uniform => 1,
            Topology::Euclidean => {
                let (Some(a), Some(b)) = (self.peer(from), self.peer(to)) else {
                    return PROXIMITY_UNKNOWN;
                };
                let dx = a.position.0 - b.position.0;
                let dy = a.position.1 - b.position.1;
                (dx * dx + dy * dy).sqrt() as u32 + 1
            }
        }
    }
}

/// Handle to a node on the direct network, bound to the node holding it
#[derive(Clone)]
pub struct DirectHandle {
    id: Id,
    address: Address,
    observer: Address,
    network: Weak<NetworkInner>,
}

impl DirectHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    /// The same node, as seen from `observer`
    fn rebind(&self, observer: Address) -> DirectHandle {
        DirectHandle {
            observer,
            ..self.clone()
        }
    }
}

impl fmt::Debug for DirectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectHandle({} @ {})", self.id, self.address)
    }
}

impl NodeHandle for DirectHandle {
    fn node_id(&self) -> Id {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.network
            .upgrade()
            .and_then(|net| net.peer(self.address))
            .is_some_and(|peer| peer.alive.load(Ordering::SeqCst))
    }

    fn proximity(&self) -> u32 {
        self.network
            .upgrade()
            .map(|net| net.proximity(self.observer, self.address))
            .unwrap_or(PROXIMITY_UNKNOWN)
    }

    fn deliver(&self, message: Message) {
        let Some(net) = self.network.upgrade() else {
            return;
        };
        let Some(peer) = net.peer(self.address) else {
            return;
        };
        if !peer.alive.load(Ordering::SeqCst) {
            debug!(to = %self.id, kind = message.kind(), "Dropping message for dead node");
            return;
        }

        net.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let kind = message.kind();
            if let Err(e) = peer.node.receive(message).await {
                debug!(node = %peer.node.node_id(), kind, error = %e, "Message handling failed");
            }
            net.delivered.fetch_add(1, Ordering::SeqCst);
            net.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Accepts only handles of its own direct network, rebinding them to the
/// verifying node so proximity is measured from there
#[derive(Clone)]
pub struct DirectVerifier {
    network: Weak<NetworkInner>,
    observer: Address,
}

impl fmt::Debug for DirectVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectVerifier({})", self.observer)
    }
}

impl Verifier for DirectVerifier {
    fn verify_handle(&self, handle: &Handle) -> std::result::Result<Handle, VerifyError> {
        match handle.as_any().downcast_ref::<DirectHandle>() {
            Some(direct) if Weak::ptr_eq(&direct.network, &self.network) => {
                Ok(Arc::new(direct.rebind(self.observer)))
            }
            _ => Err(VerifyError::ForeignHandle(handle.node_id().to_string())),
        }
    }

    fn verify_credentials(&self, _credentials: &Credentials) -> std::result::Result<(), VerifyError> {
        Ok(())
    }
}

/// A set of overlay nodes wired together in process
#[derive(Clone)]
pub struct DirectNetwork {
    inner: Arc<NetworkInner>,
    config: OverlayConfig,
}

impl DirectNetwork {
    pub fn new(config: OverlayConfig, topology: Topology, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(DirectNetwork {
            inner: Arc::new(NetworkInner {
                peers: DashMap::new(),
                next_address: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                delivered: AtomicU64::new(0),
                topology,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }),
            config,
        })
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self
            .inner
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    /// Random identifier drawn from the network's seeded generator
    pub fn random_id(&self) -> Id {
        self.with_rng(|rng| Id::random(rng))
    }

    /// Create a node with identifier `id`
    ///
    /// Identifiers are not checked for uniqueness, so collisions can be staged.
    pub fn add_node(&self, id: Id) -> Result<Arc<OverlayNode>> {
        let address = Address(self.inner.next_address.fetch_add(1, Ordering::SeqCst));
        let network = Arc::downgrade(&self.inner);
        let local = Arc::new(DirectHandle {
            id,
            address,
            observer: address,
            network: network.clone(),
        });
        let verifier = Arc::new(DirectVerifier {
            network,
            observer: address,
        });

        let (seed, position) = self.with_rng(|rng| {
            let seed: u64 = rng.gen();
            (seed, (rng.gen_range(0.0..PLANE_SIZE), rng.gen_range(0.0..PLANE_SIZE)))
        });
        let node = OverlayNode::with_seed(local, self.config.clone(), verifier, seed)?;
        self.inner.peers.insert(
            address,
            Arc::new(Peer {
                node: node.clone(),
                alive: AtomicBool::new(true),
                position,
            }),
        );
        debug!(node = %id, %address, "Node added to direct network");
        Ok(node)
    }

    pub fn add_random_node(&self) -> Result<Arc<OverlayNode>> {
        self.add_node(self.random_id())
    }

    /// Address of a node created by this network
    pub fn address_of(&self, node: &OverlayNode) -> Option<Address> {
        node.handle()
            .as_any()
            .downcast_ref::<DirectHandle>()
            .map(|h| h.address)
    }

    /// Handle to `to`, as held by `from`
    pub fn handle(&self, from: &OverlayNode, to: &OverlayNode) -> Option<Handle> {
        let observer = self.address_of(from)?;
        let target = to.handle().as_any().downcast_ref::<DirectHandle>()?;
        Some(Arc::new(target.rebind(observer)))
    }

    /// Join `node` through `bootstrap`, or start a new overlay without one
    pub async fn join(&self, node: &OverlayNode, bootstrap: Option<&OverlayNode>) -> Result<()> {
        match bootstrap.and_then(|b| self.handle(node, b)) {
            Some(handle) => node.join(handle, self.config.join_timeout()).await,
            None => {
                node.bootstrap_alone().await;
                Ok(())
            }
        }
    }

    /// Mark a node dead and shut it down
    pub fn kill(&self, node: &OverlayNode) {
        if let Some(peer) = self.address_of(node).and_then(|a| self.inner.peer(a)) {
            peer.alive.store(false, Ordering::SeqCst);
            node.shutdown();
        }
    }

    /// Every node ever added, in creation order
    pub fn nodes(&self) -> Vec<Arc<OverlayNode>> {
        let mut peers: Vec<(Address, Arc<OverlayNode>)> = self
            .inner
            .peers
            .iter()
            .map(|entry| (*entry.key(), entry.value().node.clone()))
            .collect();
        peers.sort_by_key(|(address, _)| *address);
        peers.into_iter().map(|(_, node)| node).collect()
    }

    pub fn live_nodes(&self) -> Vec<Arc<OverlayNode>> {
        self.nodes()
            .into_iter()
            .filter(|n| !n.is_shut_down())
            .collect()
    }

    /// Live node numerically closest to `key`
    pub fn closest_live(&self, key: &Id) -> Option<Id> {
        self.live_nodes()
            .iter()
            .map(|n| n.node_id())
            .min_by_key(|id| (id.distance(key), *id))
    }

    /// Run one maintenance round on every live node
    pub async fn maintain_all(&self) {
        for node in self.live_nodes() {
            if let Err(e) = node.maintain().await {
                debug!(node = %node.node_id(), error = %e, "Maintenance failed");
            }
        }
    }

    /// Messages handed to a node and not yet fully handled
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn messages_delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    /// Wait until no messages are in flight
    ///
    /// Returns false if traffic was still moving when `timeout` expired.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut quiet_polls = 0;
        loop {
            if self.in_flight() == 0 {
                quiet_polls += 1;
                if quiet_polls >= 3 {
                    return true;
                }
            } else {
                quiet_polls = 0;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
