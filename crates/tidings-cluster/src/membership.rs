//! Static-membership failure detector
//!
//! Every node heartbeats every peer once per `failover.heartbeat`. At each
//! detector tick a peer that was not heard from since the previous tick
//! accrues one miss:
//!
//! ```text
//!   alive ──(missed >= vote_after)──▶ suspect ──(missed >= node_fail_after)──▶ dead
//!     ▲                                  │                                       │
//!     └──────────────── any contact ─────┴───────────────────────────────────────┘
//! ```
//!
//! Suspect and dead peers are excluded from the ownership ring. Every change
//! of the alive set bumps the local epoch and publishes a fresh
//! [`RingSnapshot`].

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::node::{ClusterNode, NodeId, NodeState};
use crate::observability::ClusterMetrics;
use crate::protocol::{now_millis, ClusterRequest, ClusterResponse, Heartbeat, RequestHeader};
use crate::ring::Ring;
use crate::transport::PeerTransport;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Membership change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Peer missed `vote_after` heartbeats
    NodeSuspected(NodeId),
    /// Peer missed `node_fail_after` heartbeats
    NodeFailed(NodeId),
    /// Suspect or dead peer was heard from again
    NodeRecovered(NodeId),
    /// The alive set changed and the ring was recomputed
    RingChanged { epoch: u64, alive: Vec<NodeId> },
}

/// Ring over the alive set at a given epoch
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    pub epoch: u64,
    ring: Ring,
}

impl RingSnapshot {
    /// Owner of a topic under this snapshot
    pub fn owner(&self, topic: &str) -> Option<&str> {
        self.ring.owner(topic)
    }

    /// Sorted names of the alive nodes
    pub fn alive(&self) -> &[NodeId] {
        self.ring.nodes()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.ring.contains(node)
    }
}

/// Cluster membership table
pub struct Membership {
    local: NodeId,
    config: ClusterConfig,
    peers: DashMap<NodeId, ClusterNode>,
    snapshot: RwLock<Arc<RingSnapshot>>,
    /// Serializes ring recomputation
    recompute: Mutex<()>,
    correlation_id: AtomicU64,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl Membership {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;

        let peers = DashMap::new();
        for peer in config.peers() {
            peers.insert(peer.name.clone(), ClusterNode::new(&peer.name, &peer.addr));
        }

        let ring = Ring::new(config.node_names(), config.ring_replicas);
        ClusterMetrics::set_alive_nodes(ring.len());
        let (event_tx, _) = broadcast::channel(1024);

        Ok(Self {
            local: config.this_name.clone(),
            snapshot: RwLock::new(Arc::new(RingSnapshot { epoch: 0, ring })),
            config,
            peers,
            recompute: Mutex::new(()),
            correlation_id: AtomicU64::new(1),
            event_tx,
        })
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    pub fn local_id(&self) -> &str {
        &self.local
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Current ring
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.snapshot.read().epoch
    }

    /// Owner of a topic under the current ring
    pub fn owner_of(&self, topic: &str) -> Option<NodeId> {
        self.snapshot.read().owner(topic).map(str::to_string)
    }

    pub fn is_owner(&self, topic: &str) -> bool {
        self.snapshot.read().owner(topic) == Some(self.local.as_str())
    }

    /// A copy of a peer's record
    pub fn member(&self, name: &str) -> Option<ClusterNode> {
        self.peers.get(name).map(|r| r.value().clone())
    }

    /// Peer liveness; this node is always alive
    pub fn state_of(&self, name: &str) -> Option<NodeState> {
        if name == self.local {
            return Some(NodeState::Alive);
        }
        self.peers.get(name).map(|r| r.state)
    }

    /// All peers, excluding this node
    pub fn peers(&self) -> Vec<ClusterNode> {
        let mut peers: Vec<_> = self.peers.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn next_correlation_id(&self) -> u64 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Heartbeat announcing this node
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            sender: self.local.clone(),
            epoch: self.epoch(),
            timestamp_ms: now_millis(),
        }
    }

    /// Heartbeat received from a peer
    pub fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        trace!(peer = %heartbeat.sender, epoch = heartbeat.epoch, "Heartbeat received");
        self.record_contact(&heartbeat.sender, heartbeat.epoch);
    }

    /// Any evidence that `name` is up (heartbeat or heartbeat reply)
    pub fn record_contact(&self, name: &str, epoch: u64) {
        let previous = match self.peers.get_mut(name) {
            Some(mut peer) => peer.touch(epoch),
            None => {
                if name != self.local {
                    debug!(peer = %name, "Contact from unknown node ignored");
                }
                return;
            }
        };

        if let Some(old) = previous {
            info!(peer = %name, from = %old, "Node recovered");
            let _ = self
                .event_tx
                .send(MembershipEvent::NodeRecovered(name.to_string()));
            self.recompute_ring();
        }
    }

    /// Advance the failure detector by one heartbeat period
    pub fn tick(&self) {
        if !self.config.failover.enabled {
            return;
        }
        let vote_after = self.config.failover.vote_after;
        let fail_after = self.config.failover.node_fail_after;

        let mut events = Vec::new();
        for mut peer in self.peers.iter_mut() {
            if peer.contacted {
                peer.contacted = false;
                continue;
            }
            peer.missed = peer.missed.saturating_add(1);
            if peer.missed >= fail_after && peer.state != NodeState::Dead {
                peer.mark_dead();
                events.push(MembershipEvent::NodeFailed(peer.name.clone()));
            } else if peer.missed >= vote_after && peer.state == NodeState::Alive {
                peer.mark_suspect();
                events.push(MembershipEvent::NodeSuspected(peer.name.clone()));
            }
        }

        if events.is_empty() {
            return;
        }
        for event in events {
            match &event {
                MembershipEvent::NodeSuspected(name) => {
                    warn!(peer = %name, "Node suspected");
                    ClusterMetrics::increment_nodes_suspected();
                }
                MembershipEvent::NodeFailed(name) => {
                    warn!(peer = %name, "Node declared dead");
                    ClusterMetrics::increment_nodes_failed();
                }
                _ => {}
            }
            let _ = self.event_tx.send(event);
        }
        self.recompute_ring();
    }

    fn alive_set(&self) -> Vec<NodeId> {
        if !self.config.failover.enabled {
            return self.config.node_names();
        }
        let mut alive: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|r| r.is_healthy())
            .map(|r| r.name.clone())
            .collect();
        alive.push(self.local.clone());
        alive
    }

    /// Rebuild the ring if the alive set changed
    fn recompute_ring(&self) {
        let _guard = self.recompute.lock();
        let ring = Ring::new(self.alive_set(), self.config.ring_replicas);

        let current = self.snapshot();
        if current.alive() == ring.nodes() {
            return;
        }
        let epoch = current.epoch + 1;
        let alive = ring.nodes().to_vec();
        *self.snapshot.write() = Arc::new(RingSnapshot { epoch, ring });

        info!(epoch, alive = ?alive, "Ring changed");
        ClusterMetrics::set_alive_nodes(alive.len());
        ClusterMetrics::set_epoch(epoch);
        ClusterMetrics::increment_ring_changes();
        let _ = self
            .event_tx
            .send(MembershipEvent::RingChanged { epoch, alive });
    }

    /// Heartbeat loop. Returns at once when failover is disabled.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn PeerTransport>, shutdown: CancellationToken) {
        if !self.config.failover.enabled || self.peers.is_empty() {
            debug!("Failover disabled, heartbeat loop not started");
            return;
        }

        let period = self.config.failover.heartbeat;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first = true;

        info!(
            node = %self.local,
            heartbeat = ?period,
            vote_after = self.config.failover.vote_after,
            node_fail_after = self.config.failover.node_fail_after,
            "Heartbeat loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    info!(node = %self.local, "Heartbeat loop stopped");
                    return;
                }
            }

            if !first {
                self.tick();
            }
            first = false;

            let membership = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move { membership.send_heartbeats(transport.as_ref()).await });
        }
    }

    async fn send_heartbeats(&self, transport: &dyn PeerTransport) {
        let period = self.config.failover.heartbeat;
        let heartbeat = self.heartbeat();
        let names: Vec<NodeId> = self.peers.iter().map(|r| r.key().clone()).collect();

        let sends = names.into_iter().map(|peer| {
            let request = ClusterRequest::Heartbeat {
                header: RequestHeader::new(self.next_correlation_id(), self.local.clone())
                    .with_timeout(period),
                heartbeat: heartbeat.clone(),
            };
            async move {
                let result = timeout(period, transport.send(&peer, request)).await;
                (peer, result)
            }
        });

        for (peer, result) in futures::future::join_all(sends).await {
            ClusterMetrics::increment_heartbeats_sent();
            match result {
                Ok(Ok(ClusterResponse::Heartbeat { header, epoch })) if header.is_success() => {
                    self.record_contact(&peer, epoch);
                }
                Ok(Ok(other)) => {
                    debug!(peer = %peer, response = ?other.header(), "Heartbeat rejected");
                    ClusterMetrics::increment_heartbeats_failed();
                }
                Ok(Err(e)) => {
                    trace!(peer = %peer, error = %e, "Heartbeat failed");
                    ClusterMetrics::increment_heartbeats_failed();
                }
                Err(_) => {
                    trace!(peer = %peer, "Heartbeat timed out");
                    ClusterMetrics::increment_heartbeats_failed();
                }
            }
        }
    }
}
