//! Overlay node engine
//!
//! Wraps the routing state of one node behind a lock, dispatches incoming
//! messages to the protocol handlers and performs their side effects once
//! the lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use ringmesh_protocol::{
    AppMessage, AppTag, Credentials, Handle, Id, LeafSetSnapshot, Message, RouteMessage,
    RoutedPayload,
};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OverlayConfig;
use crate::error::{Result, RoutingError};
use crate::router::NextHop;
use crate::security::{PermissiveVerifier, Verifier};
use crate::state::{
    Delivery, JoinFailure, JoinState, OverlayEvent, Outbox, RouterStats, RoutingState,
};

/// Capacity of the membership event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One overlay participant
pub struct OverlayNode {
    handle: Handle,
    node_id: Id,
    config: OverlayConfig,
    state: RwLock<RoutingState>,
    applications: DashMap<AppTag, mpsc::UnboundedSender<Delivery>>,
    events: broadcast::Sender<OverlayEvent>,
    join_status: watch::Sender<JoinState>,
    shut_down: AtomicBool,
}

impl OverlayNode {
    /// Create a node that trusts every handle it is given
    pub fn new(handle: Handle, config: OverlayConfig) -> Result<Arc<Self>> {
        Self::with_verifier(handle, config, Arc::new(PermissiveVerifier))
    }

    pub fn with_verifier(
        handle: Handle,
        config: OverlayConfig,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Arc<Self>> {
        let state = RoutingState::new(handle.clone(), config.clone(), verifier)?;
        Ok(Self::from_state(handle, config, state))
    }

    /// Create a node whose random choices are reproducible from `seed`
    pub fn with_seed(
        handle: Handle,
        config: OverlayConfig,
        verifier: Arc<dyn Verifier>,
        seed: u64,
    ) -> Result<Arc<Self>> {
        let rng = StdRng::seed_from_u64(seed);
        let state = RoutingState::with_rng(handle.clone(), config.clone(), verifier, rng)?;
        Ok(Self::from_state(handle, config, state))
    }

    fn from_state(handle: Handle, config: OverlayConfig, state: RoutingState) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (join_status, _) = watch::channel(JoinState::Idle);
        let node_id = handle.node_id();

        debug!(node = %node_id, "Overlay node created");

        Arc::new(OverlayNode {
            handle,
            node_id,
            config,
            state: RwLock::new(state),
            applications: DashMap::new(),
            events,
            join_status,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Handle of this node, as seen by itself
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn node_id(&self) -> Id {
        self.node_id
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Register an application and receive the payloads delivered to it
    ///
    /// Registering a tag again replaces the previous receiver.
    pub fn register_application(&self, tag: AppTag) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.applications.insert(tag, tx);
        rx
    }

    /// Subscribe to membership and join events
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    pub fn join_state(&self) -> JoinState {
        *self.join_status.borrow()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop accepting messages
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            info!(node = %self.node_id, "Overlay node shutting down");
            // Wake anyone waiting on the join
            let current = *self.join_status.borrow();
            self.join_status.send_replace(current);
        }
    }

    /// Route an application payload to the node closest to `key`
    pub async fn route(
        &self,
        key: Id,
        tag: AppTag,
        body: Vec<u8>,
        credentials: Credentials,
    ) -> Result<()> {
        if !self.applications.contains_key(&tag) {
            return Err(RoutingError::UnknownApplication(tag.to_string()));
        }
        let message = RouteMessage::new(
            key,
            self.node_id,
            RoutedPayload::App(AppMessage { tag, body }),
            credentials,
        );
        self.receive(Message::Route(message)).await
    }

    /// Send a join request through `bootstrap` without waiting for the outcome
    pub async fn initiate_join(&self, bootstrap: Handle) -> Result<()> {
        self.receive(Message::InitiateJoin { bootstrap }).await
    }

    /// Join through `bootstrap` and wait until the join completes
    pub async fn join(&self, bootstrap: Handle, timeout: Duration) -> Result<()> {
        let mut status = self.join_status.subscribe();
        self.initiate_join(bootstrap).await?;

        let wait = async {
            loop {
                if self.is_shut_down() {
                    return Err(RoutingError::NodeShutdown);
                }
                let current = *status.borrow_and_update();
                match current {
                    JoinState::Ready => return Ok(()),
                    JoinState::Failed(JoinFailure::IdCollision) => {
                        return Err(RoutingError::IdCollision(self.node_id.to_hex()))
                    }
                    JoinState::Failed(JoinFailure::Timeout) => {
                        return Err(RoutingError::JoinTimeout(timeout.as_millis() as u64))
                    }
                    JoinState::Idle | JoinState::Joining { .. } => {}
                }
                if status.changed().await.is_err() {
                    return Err(RoutingError::NodeShutdown);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(node = %self.node_id, timeout_ms = timeout.as_millis() as u64, "Join timed out");
                let mut out = Outbox::default();
                {
                    let mut state = self.state.write().await;
                    state.fail_join(JoinFailure::Timeout, &mut out);
                }
                self.flush(out);
                Err(RoutingError::JoinTimeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Become the first node of a new overlay
    pub async fn bootstrap_alone(&self) {
        let mut out = Outbox::default();
        {
            let mut state = self.state.write().await;
            state.bootstrap_alone(&mut out);
        }
        self.flush(out);
    }

    /// Run one maintenance round now
    pub async fn maintain(&self) -> Result<()> {
        self.receive(Message::InitiateMaintenance).await
    }

    /// Start the periodic maintenance task, if an interval is configured
    ///
    /// The task stops once the node is shut down or dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.maintenance_interval()?;
        let node = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                if node.is_shut_down() {
                    break;
                }
                if let Err(e) = node.maintain().await {
                    warn!(node = %node.node_id, error = %e, "Maintenance failed");
                }
            }
        }))
    }

    /// Handle one incoming message
    pub async fn receive(&self, message: Message) -> Result<()> {
        if self.is_shut_down() {
            return Err(RoutingError::NodeShutdown);
        }

        let mut out = Outbox::default();
        let result = {
            let mut state = self.state.write().await;
            let result = match message {
                Message::Route(_) => state.receive_message(message, &mut out),
                Message::InitiateJoin { bootstrap } => {
                    state.initiate_join(&bootstrap, &mut out).map(|_| ())
                }
                Message::JoinRequest(request) => {
                    state.join_accepted(request, &mut out);
                    Ok(())
                }
                Message::JoinRejected {
                    token, terminal, ..
                } => {
                    state.join_rejected(token, &terminal, &mut out);
                    Ok(())
                }
                Message::BroadcastLeafSet(broadcast) => {
                    state.receive_leaf_set(broadcast, &mut out);
                    Ok(())
                }
                Message::RequestLeafSet { from } => {
                    state.leaf_set_requested(&from, &mut out);
                    Ok(())
                }
                Message::BroadcastRouteRow(broadcast) => {
                    state.receive_route_row(broadcast);
                    Ok(())
                }
                Message::RequestRouteRow { from, row } => {
                    state.route_row_requested(&from, row, &mut out)
                }
                Message::InitiateMaintenance => {
                    state.maintain(&mut out);
                    Ok(())
                }
            };
            state.collect_changes(&mut out);
            result
        };

        self.flush(out);
        result
    }

    /// Perform the side effects collected under the lock
    fn flush(&self, out: Outbox) {
        if let Some(state) = out.join_state {
            self.join_status.send_replace(state);
        }

        for event in out.events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }

        for delivery in out.deliveries {
            match self.applications.get(&delivery.tag) {
                Some(tx) => {
                    if tx.send(delivery).is_err() {
                        debug!(node = %self.node_id, "Application receiver dropped");
                    }
                }
                None => {
                    warn!(
                        node = %self.node_id,
                        tag = %delivery.tag,
                        "Dropping delivery for unregistered application"
                    );
                }
            }
        }

        for (to, message) in out.sends {
            to.deliver(message);
        }
    }

    /// Routing decision this node would take for `key`
    pub async fn next_hop(&self, key: &Id) -> NextHop {
        self.state.write().await.next_hop(key)
    }

    pub async fn leaf_set(&self) -> LeafSetSnapshot {
        self.state.read().await.leaf_set().snapshot()
    }

    /// Identifiers of the distinct leaf set members
    pub async fn leaf_set_members(&self) -> Vec<Id> {
        self.state
            .read()
            .await
            .leaf_set()
            .members()
            .iter()
            .map(|h| h.node_id())
            .collect()
    }

    pub async fn routing_table_size(&self) -> usize {
        self.state.read().await.routing_table().size()
    }

    pub async fn stats(&self) -> RouterStats {
        self.state.read().await.stats().clone()
    }
}

impl std::fmt::Debug for OverlayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayNode")
            .field("node_id", &self.node_id)
            .field("join_state", &self.join_state())
            .finish()
    }
}
