//! Heartbeat failure detection across three in-process nodes

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tidings_cluster::{
    ClusterConfig, ClusterHandler, ClusterRequest, ClusterResponse, LocalNetwork, Membership,
    MembershipEvent, NodeState, ResponseHeader, StatusCode,
};
use tokio_util::sync::CancellationToken;

const HEARTBEAT: Duration = Duration::from_millis(100);

/// Answers heartbeats and feeds them to the membership table
struct HeartbeatHandler {
    membership: Arc<Membership>,
}

#[async_trait]
impl ClusterHandler for HeartbeatHandler {
    async fn handle(&self, request: ClusterRequest) -> ClusterResponse {
        match request {
            ClusterRequest::Heartbeat { header, heartbeat } => {
                self.membership.record_heartbeat(&heartbeat);
                ClusterResponse::Heartbeat {
                    header: ResponseHeader::success(header.correlation_id),
                    epoch: self.membership.epoch(),
                }
            }
            other => ClusterResponse::Error {
                header: ResponseHeader::error(
                    other.header().correlation_id,
                    StatusCode::InvalidRequest,
                    "heartbeat only",
                ),
            },
        }
    }
}

fn config(this: &str) -> ClusterConfig {
    ClusterConfig::builder()
        .node("a", "a:1")
        .node("b", "b:1")
        .node("c", "c:1")
        .this_name(this)
        .heartbeat(HEARTBEAT, 3, 6)
        .build()
        .unwrap()
}

struct TestCluster {
    net: Arc<LocalNetwork>,
    nodes: Vec<(Arc<Membership>, Arc<dyn ClusterHandler>)>,
    shutdown: CancellationToken,
}

impl TestCluster {
    fn start() -> Self {
        let net = LocalNetwork::new();
        let shutdown = CancellationToken::new();
        let mut nodes = Vec::new();
        for name in ["a", "b", "c"] {
            let membership = Arc::new(Membership::new(config(name)).unwrap());
            let handler: Arc<dyn ClusterHandler> = Arc::new(HeartbeatHandler {
                membership: membership.clone(),
            });
            net.register(name, Arc::downgrade(&handler));
            tokio::spawn(
                membership
                    .clone()
                    .run(Arc::new(net.endpoint(name)), shutdown.clone()),
            );
            nodes.push((membership, handler));
        }
        Self {
            net,
            nodes,
            shutdown,
        }
    }

    fn membership(&self, idx: usize) -> &Arc<Membership> {
        &self.nodes[idx].0
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn test_healthy_cluster_stays_stable() {
    let cluster = TestCluster::start();
    tokio::time::sleep(HEARTBEAT * 50).await;

    for idx in 0..3 {
        let m = cluster.membership(idx);
        assert_eq!(m.epoch(), 0, "node {} changed its ring", m.local_id());
        assert_eq!(m.snapshot().alive(), ["a", "b", "c"]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_dead_node_removed_within_failure_window() {
    let cluster = TestCluster::start();
    let mut events = cluster.membership(0).subscribe();
    tokio::time::sleep(HEARTBEAT * 5).await;

    cluster.net.kill("b");
    // node_fail_after heartbeats plus slack for the tick in flight
    tokio::time::sleep(HEARTBEAT * 8).await;

    for idx in [0, 2] {
        let m = cluster.membership(idx);
        assert_eq!(m.state_of("b"), Some(NodeState::Dead));
        assert_eq!(m.snapshot().alive(), ["a", "c"]);
    }

    // a and c agree on every owner
    let a = cluster.membership(0).snapshot();
    let c = cluster.membership(2).snapshot();
    for i in 0..200 {
        let topic = format!("grp{}", i);
        assert_eq!(a.owner(&topic), c.owner(&topic));
        assert_ne!(a.owner(&topic), Some("b"));
    }

    let mut seen = Vec::new();
    while let Ok(e) = events.try_recv() {
        seen.push(e);
    }
    assert!(seen.contains(&MembershipEvent::NodeSuspected("b".into())));
    assert!(seen.contains(&MembershipEvent::NodeFailed("b".into())));
}

#[tokio::test(start_paused = true)]
async fn test_revived_node_rejoins_ring() {
    let cluster = TestCluster::start();
    cluster.net.kill("c");
    tokio::time::sleep(HEARTBEAT * 10).await;
    assert_eq!(cluster.membership(0).snapshot().alive(), ["a", "b"]);

    cluster.net.revive("c");
    tokio::time::sleep(HEARTBEAT * 3).await;
    assert_eq!(cluster.membership(0).state_of("c"), Some(NodeState::Alive));
    assert_eq!(cluster.membership(0).snapshot().alive(), ["a", "b", "c"]);
    assert_eq!(cluster.membership(2).snapshot().alive(), ["a", "b", "c"]);
}
