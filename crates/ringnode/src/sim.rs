//! Overlay simulation over the direct network
//!
//! Nodes join one at a time, random keys are routed from random nodes, and
//! every delivery is checked against the live node numerically closest to
//! its key. A second lookup round runs after some nodes are killed and the
//! survivors have run maintenance.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ringmesh_protocol::{AppTag, Credentials, Id};
use ringmesh_routing::{Delivery, DirectNetwork, OverlayConfig, OverlayNode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::config::SimulationConfig;

/// Application tag used for lookups
pub const LOOKUP_APP: AppTag = AppTag::new(0x5157);

/// Outcome of one round of lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRound {
    pub label: String,
    pub live_nodes: usize,
    pub lookups: usize,
    pub delivered: usize,
    /// Delivered somewhere other than the closest live node
    pub misrouted: usize,
    /// Never delivered anywhere
    pub lost: usize,
    pub max_hops: u32,
    pub mean_hops: f64,
}

impl LookupRound {
    pub fn is_clean(&self) -> bool {
        self.misrouted == 0 && self.lost == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub nodes: usize,
    pub joined: usize,
    pub join_failures: usize,
    pub killed: usize,
    pub rounds: Vec<LookupRound>,
    /// Messages delivered by the direct network over the whole run
    pub messages: u64,
}

impl SimulationReport {
    pub fn is_clean(&self) -> bool {
        self.join_failures == 0 && self.rounds.iter().all(LookupRound::is_clean)
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "nodes: {} joined, {} failed to join, {} killed",
            self.joined, self.join_failures, self.killed
        )?;
        for round in &self.rounds {
            writeln!(
                f,
                "{:<12} live={:<5} lookups={:<5} delivered={:<5} misrouted={:<4} lost={:<4} hops(mean={:.2}, max={})",
                round.label,
                round.live_nodes,
                round.lookups,
                round.delivered,
                round.misrouted,
                round.lost,
                round.mean_hops,
                round.max_hops
            )?;
        }
        write!(f, "messages: {}", self.messages)
    }
}

struct Member {
    node: Arc<OverlayNode>,
    deliveries: UnboundedReceiver<Delivery>,
}

/// Run a full simulation
pub async fn run(overlay: &OverlayConfig, sim: &SimulationConfig) -> Result<SimulationReport> {
    let net = DirectNetwork::new(overlay.clone(), sim.topology, sim.seed)
        .context("Failed to build direct network")?;
    let mut rng = StdRng::seed_from_u64(sim.seed.wrapping_add(1));

    let mut members: Vec<Member> = Vec::with_capacity(sim.nodes);
    let mut join_failures = 0;

    info!(nodes = sim.nodes, seed = sim.seed, "Building overlay");
    for _ in 0..sim.nodes {
        let node = net.add_random_node()?;
        let bootstrap = if members.is_empty() {
            None
        } else {
            Some(members[rng.gen_range(0..members.len())].node.clone())
        };

        match net.join(&node, bootstrap.as_deref()).await {
            Ok(()) => {
                debug!(node = %node.node_id(), "Node joined");
                let deliveries = node.register_application(LOOKUP_APP);
                members.push(Member { node, deliveries });
            }
            Err(e) => {
                warn!(node = %node.node_id(), error = %e, "Join failed");
                join_failures += 1;
                net.kill(&node);
            }
        }
        settle(&net, sim).await;
    }

    let mut rounds = vec![lookup_round("joined", &net, &mut members, sim, &mut rng).await];

    let killed = kill_random(&net, &members, sim.failures, &mut rng);
    if killed > 0 {
        info!(killed, "Killed nodes, running maintenance");
        for _ in 0..2 {
            net.maintain_all().await;
            settle(&net, sim).await;
        }
        rounds.push(lookup_round("after-churn", &net, &mut members, sim, &mut rng).await);
    }

    Ok(SimulationReport {
        nodes: sim.nodes,
        joined: members.len(),
        join_failures,
        killed,
        rounds,
        messages: net.messages_delivered(),
    })
}

async fn settle(net: &DirectNetwork, sim: &SimulationConfig) {
    if !net.settle(sim.settle_timeout()).await {
        warn!(in_flight = net.in_flight(), "Network did not settle");
    }
}

fn kill_random(net: &DirectNetwork, members: &[Member], count: usize, rng: &mut StdRng) -> usize {
    let mut killed = 0;
    while killed < count {
        let live: Vec<&Member> = members.iter().filter(|m| !m.node.is_shut_down()).collect();
        if live.len() <= 1 {
            break;
        }
        let victim = live[rng.gen_range(0..live.len())];
        debug!(node = %victim.node.node_id(), "Killing node");
        net.kill(&victim.node);
        killed += 1;
    }
    killed
}

async fn lookup_round(
    label: &str,
    net: &DirectNetwork,
    members: &mut [Member],
    sim: &SimulationConfig,
    rng: &mut StdRng,
) -> LookupRound {
    let live: Vec<Arc<OverlayNode>> = members
        .iter()
        .filter(|m| !m.node.is_shut_down())
        .map(|m| m.node.clone())
        .collect();

    let mut expected: Vec<Option<Id>> = Vec::with_capacity(sim.lookups);
    if !live.is_empty() {
        for lookup in 0..sim.lookups {
            let key = Id::random(rng);
            let source = &live[rng.gen_range(0..live.len())];
            expected.push(net.closest_live(&key));
            let body = (lookup as u64).to_be_bytes().to_vec();
            if let Err(e) = source.route(key, LOOKUP_APP, body, Credentials::default()).await {
                warn!(key = %key, error = %e, "Lookup not routed");
            }
        }
    }
    settle(net, sim).await;

    let mut delivered = 0;
    let mut misrouted = 0;
    let mut total_hops = 0u64;
    let mut max_hops = 0;
    for member in members.iter_mut() {
        while let Ok(delivery) = member.deliveries.try_recv() {
            let Some(expected) = lookup_index(&delivery.body).and_then(|i| expected.get(i)) else {
                continue;
            };
            delivered += 1;
            total_hops += u64::from(delivery.hops);
            max_hops = max_hops.max(delivery.hops);
            if *expected != Some(member.node.node_id()) {
                misrouted += 1;
                warn!(
                    key = %delivery.key,
                    at = %member.node.node_id(),
                    "Lookup delivered to the wrong node"
                );
            }
        }
    }

    let round = LookupRound {
        label: label.to_string(),
        live_nodes: live.len(),
        lookups: expected.len(),
        delivered,
        misrouted,
        lost: expected.len().saturating_sub(delivered),
        max_hops,
        mean_hops: if delivered == 0 {
            0.0
        } else {
            total_hops as f64 / delivered as f64
        },
    };
    info!(
        round = label,
        delivered = round.delivered,
        misrouted = round.misrouted,
        lost = round.lost,
        mean_hops = round.mean_hops,
        "Lookup round finished"
    );
    round
}

fn lookup_index(body: &[u8]) -> Option<usize> {
    let bytes: [u8; 8] = body.try_into().ok()?;
    usize::try_from(u64::from_be_bytes(bytes)).ok()
}
