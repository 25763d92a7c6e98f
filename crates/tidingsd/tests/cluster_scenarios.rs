//! Topic routing across three in-process nodes sharing one store

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tidings_cluster::{
    ClusterConfig, ClusterHandler, ClusterRequest, ClusterResponse, LocalNetwork, ProxyOp,
    ProxyRequest, ProxyResult, RequestHeader, Ring, SessionRef, DEFAULT_REPLICAS,
};
use tidingsd::store::TopicRecord;
use tidingsd::{
    MemoryStore, Node, ServerConfig, ServerContext, ServerMessage, SessionHandle, Store,
    TopicKind, TopicName, TopicRole, TopicState, TopicStats, TransportKind,
};
use uuid::Uuid;

const HEARTBEAT: Duration = Duration::from_millis(100);

fn config(this: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.cluster = ClusterConfig::builder()
        .node("a", "a:1")
        .node("b", "b:1")
        .node("c", "c:1")
        .this_name(this)
        .heartbeat(HEARTBEAT, 3, 6)
        .build()
        .unwrap();
    config
}

struct TestCluster {
    net: Arc<LocalNetwork>,
    store: Arc<MemoryStore>,
    nodes: BTreeMap<&'static str, Arc<Node>>,
}

impl TestCluster {
    fn start() -> Self {
        let net = LocalNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let mut nodes = BTreeMap::new();
        for name in ["a", "b", "c"] {
            let ctx = ServerContext::builder(config(name))
                .store(store.clone())
                .build()
                .unwrap();
            let node = Node::new(ctx, Arc::new(net.endpoint(name))).unwrap();
            let handler: Arc<dyn ClusterHandler> = node.clone();
            net.register(name, Arc::downgrade(&handler));
            node.start();
            nodes.insert(name, node);
        }
        Self { net, store, nodes }
    }

    fn node(&self, name: &str) -> &Arc<Node> {
        &self.nodes[name]
    }

    async fn create_group(&self, name: &str, owner: &str) {
        self.store
            .create_topic(TopicRecord::new(name, TopicKind::Group, Some(owner.to_string())))
            .await
            .unwrap();
    }
}

/// A group owned by `b` that moves to `next` once `b` is gone
fn group_moving_to(next: &str) -> String {
    let full = Ring::new(["a", "b", "c"], DEFAULT_REPLICAS);
    let survivors = Ring::new(["a", "c"], DEFAULT_REPLICAS);
    (0..10_000)
        .map(|i| format!("grp{}", i))
        .find(|name| full.owner(name) == Some("b") && survivors.owner(name) == Some(next))
        .unwrap()
}

async fn next(handle: &mut SessionHandle) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(10), handle.outbound.recv())
        .await
        .unwrap()
        .unwrap()
}

/// The publisher sees its own message and the acknowledgement, in either order
async fn expect_published(handle: &mut SessionHandle, seq: u64) {
    let mut data = false;
    let mut acked = false;
    for _ in 0..2 {
        match next(handle).await {
            ServerMessage::Data(envelope) => {
                assert_eq!(envelope.seq, seq);
                data = true;
            }
            ServerMessage::Ack { result, .. } => {
                assert_eq!(result, Ok(seq));
                acked = true;
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    assert!(data && acked);
}

async fn expect_data(handle: &mut SessionHandle, seq: u64) {
    match next(handle).await {
        ServerMessage::Data(envelope) => assert_eq!(envelope.seq, seq),
        other => panic!("unexpected message {:?}", other),
    }
}

async fn wait_for_owner(node: &Node, topic: &str, owner: &str) {
    for _ in 0..100 {
        if node.cluster().membership().owner_of(topic).as_deref() == Some(owner) {
            return;
        }
        tokio::time::sleep(HEARTBEAT).await;
    }
    panic!("{} never saw {} as owner of {}", node.local_id(), owner, topic);
}

async fn wait_for_stats(node: &Node, name: &TopicName, check: impl Fn(&TopicStats) -> bool) -> TopicStats {
    for _ in 0..200 {
        if let Some(stats) = node.hub().topic_stats(name).await {
            if check(&stats) {
                return stats;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("topic {} on {} never reached the expected state", name, node.local_id());
}

#[tokio::test(start_paused = true)]
async fn test_proxy_follows_owner_after_failure() {
    let cluster = TestCluster::start();
    let topic = group_moving_to("c");
    let name = TopicName::from_routing(&topic).unwrap();
    cluster.create_group(&topic, "alice").await;
    tokio::time::sleep(HEARTBEAT * 5).await;
    assert_eq!(
        cluster.node("a").cluster().membership().owner_of(&topic).as_deref(),
        Some("b")
    );

    let a = cluster.node("a").sessions().clone();
    let c = cluster.node("c").sessions().clone();
    let mut alice = a.connect("alice", TransportKind::WebSocket).unwrap();
    let mut bob = c.connect("bob", TransportKind::LongPoll).unwrap();

    let sub = a.subscribe(alice.id(), &topic).await.unwrap();
    assert_eq!(sub.last_seq, 0);
    c.subscribe(bob.id(), &topic).await.unwrap();

    let stats = cluster.node("a").hub().topic_stats(&name).await.unwrap();
    assert_eq!(stats.role, TopicRole::Proxy);
    assert_eq!(stats.local_subscribers, 1);

    a.publish(alice.id(), &topic, Bytes::from_static(b"one")).await.unwrap();
    expect_published(&mut alice, 1).await;
    expect_data(&mut bob, 1).await;

    cluster.net.kill("b");
    wait_for_owner(cluster.node("a"), &topic, "c").await;
    wait_for_owner(cluster.node("c"), &topic, "c").await;

    // c's proxy hands bob to a local master; a's proxy re-subscribes alice there
    wait_for_stats(cluster.node("c"), &name, |s| {
        s.role == TopicRole::Master && s.local_subscribers == 1 && s.remote_subscribers == 1
    })
    .await;
    let stats = wait_for_stats(cluster.node("a"), &name, |s| s.pending == 0).await;
    assert_eq!(stats.role, TopicRole::Proxy);

    a.publish(alice.id(), &topic, Bytes::from_static(b"two")).await.unwrap();
    expect_published(&mut alice, 2).await;
    expect_data(&mut bob, 2).await;

    let history = c.history(bob.id(), &topic, 0, 10).await.unwrap();
    let seqs: Vec<u64> = history.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, [1, 2]);
    assert_eq!(cluster.store.messages(&topic).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_proxy_hands_off_when_ownership_arrives() {
    let cluster = TestCluster::start();
    let topic = group_moving_to("a");
    let name = TopicName::from_routing(&topic).unwrap();
    cluster.create_group(&topic, "alice").await;
    tokio::time::sleep(HEARTBEAT * 5).await;

    let a = cluster.node("a").sessions().clone();
    let mut alice = a.connect("alice", TransportKind::WebSocket).unwrap();
    a.subscribe(alice.id(), &topic).await.unwrap();
    a.publish(alice.id(), &topic, Bytes::from_static(b"one")).await.unwrap();
    expect_published(&mut alice, 1).await;

    cluster.net.kill("b");
    wait_for_owner(cluster.node("a"), &topic, "a").await;
    let stats = wait_for_stats(cluster.node("a"), &name, |s| {
        s.role == TopicRole::Master && s.local_subscribers == 1
    })
    .await;
    assert_eq!(stats.last_seq, 1);

    a.publish(alice.id(), &topic, Bytes::from_static(b"two")).await.unwrap();
    expect_published(&mut alice, 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_forwarded_publish_is_idempotent() {
    let cluster = TestCluster::start();
    let topic = group_moving_to("c");
    cluster.create_group(&topic, "alice").await;
    tokio::time::sleep(HEARTBEAT * 5).await;

    let master = cluster.node("b");
    let session = SessionRef {
        session_id: Uuid::new_v4(),
        principal: "alice".into(),
        origin: "a".into(),
    };
    let call = |id: u64, op: ProxyOp, client_seq: u64| ClusterRequest::Proxy {
        header: RequestHeader::new(id, "a"),
        request: ProxyRequest {
            topic: topic.clone(),
            op,
            session: session.clone(),
            client_seq,
        },
    };

    let response = master.handle(call(1, ProxyOp::Subscribe, 0)).await;
    assert!(response.header().is_success());

    let publish = || ProxyOp::Publish {
        payload: Bytes::from_static(b"once"),
    };
    let first = master.handle(call(2, publish(), 7)).await;
    let retry = master.handle(call(3, publish(), 7)).await;
    match (first, retry) {
        (
            ClusterResponse::Proxy {
                result: Some(ProxyResult::Published { seq: a, duplicate: false }),
                ..
            },
            ClusterResponse::Proxy {
                result: Some(ProxyResult::Published { seq: b, duplicate: true }),
                ..
            },
        ) => assert_eq!(a, b),
        other => panic!("unexpected responses {:?}", other),
    }
    assert_eq!(cluster.store.messages(&topic).len(), 1);

    // A node that does not own the topic refuses to serve it
    let response = cluster.node("a").handle(call(4, ProxyOp::Subscribe, 0)).await;
    assert_eq!(response.header().status, tidings_cluster::StatusCode::NotOwner);
}

fn standalone() -> Arc<Node> {
    let ctx = ServerContext::from_config(ServerConfig::default()).unwrap();
    let net = LocalNetwork::new();
    Node::new(ctx, Arc::new(net.endpoint("local"))).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_master_unloads_after_idle_timeout() {
    let node = standalone();
    let master_idle = node.context().timeouts().master_idle;
    node.context()
        .store
        .create_topic(TopicRecord::new("grpIdle", TopicKind::Group, None))
        .await
        .unwrap();
    let name = TopicName::from_routing("grpIdle").unwrap();

    let sessions = node.sessions().clone();
    let alice = sessions.connect("alice", TransportKind::WebSocket).unwrap();
    sessions.subscribe(alice.id(), "grpIdle").await.unwrap();
    sessions.unsubscribe(alice.id(), "grpIdle").await.unwrap();

    let stats = node.hub().topic_stats(&name).await.unwrap();
    assert_eq!(stats.state, TopicState::Draining);

    tokio::time::sleep(master_idle - Duration::from_millis(10)).await;
    assert!(node.hub().handle(&name).is_some());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(node.hub().handle(&name).is_none());
    assert!(node.hub().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_cancels_idle_unload() {
    let node = standalone();
    let master_idle = node.context().timeouts().master_idle;
    node.context()
        .store
        .create_topic(TopicRecord::new("grpBusy", TopicKind::Group, None))
        .await
        .unwrap();
    let name = TopicName::from_routing("grpBusy").unwrap();

    let sessions = node.sessions().clone();
    let alice = sessions.connect("alice", TransportKind::WebSocket).unwrap();
    sessions.subscribe(alice.id(), "grpBusy").await.unwrap();
    sessions.unsubscribe(alice.id(), "grpBusy").await.unwrap();

    tokio::time::sleep(master_idle / 2).await;
    sessions.subscribe(alice.id(), "grpBusy").await.unwrap();
    tokio::time::sleep(master_idle * 2).await;

    let stats = node.hub().topic_stats(&name).await.unwrap();
    assert_eq!(stats.role, TopicRole::Master);
    assert_eq!(stats.state, TopicState::Live);
    assert_eq!(stats.local_subscribers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_just_before_expiry_keeps_master() {
    let node = standalone();
    let master_idle = node.context().timeouts().master_idle;
    node.context()
        .store
        .create_topic(TopicRecord::new("grpEdge", TopicKind::Group, None))
        .await
        .unwrap();
    let name = TopicName::from_routing("grpEdge").unwrap();

    let sessions = node.sessions().clone();
    let alice = sessions.connect("alice", TransportKind::WebSocket).unwrap();
    sessions.subscribe(alice.id(), "grpEdge").await.unwrap();
    sessions.unsubscribe(alice.id(), "grpEdge").await.unwrap();

    tokio::time::sleep(master_idle - Duration::from_millis(1)).await;
    sessions.subscribe(alice.id(), "grpEdge").await.unwrap();

    // Past the deadline set by the unsubscribe
    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = node.hub().topic_stats(&name).await.unwrap();
    assert_eq!(stats.state, TopicState::Live);
    assert_eq!(stats.local_subscribers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_proxy_unloads_after_proxy_idle() {
    let cluster = TestCluster::start();
    let topic = group_moving_to("c");
    let name = TopicName::from_routing(&topic).unwrap();
    cluster.create_group(&topic, "alice").await;
    tokio::time::sleep(HEARTBEAT * 5).await;

    let a = cluster.node("a");
    let timeouts = a.context().timeouts();
    assert!(timeouts.proxy_idle < timeouts.master_idle);

    let sessions = a.sessions().clone();
    let alice = sessions.connect("alice", TransportKind::WebSocket).unwrap();
    sessions.subscribe(alice.id(), &topic).await.unwrap();
    sessions.unsubscribe(alice.id(), &topic).await.unwrap();

    let stats = a.hub().topic_stats(&name).await.unwrap();
    assert_eq!(stats.role, TopicRole::Proxy);
    assert_eq!(stats.state, TopicState::Draining);

    tokio::time::sleep(timeouts.proxy_idle - Duration::from_millis(10)).await;
    assert!(a.hub().handle(&name).is_some());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a.hub().handle(&name).is_none());

    // The master on b waits out its own, longer deadline
    assert!(cluster.node("b").hub().handle(&name).is_some());
}

#[tokio::test]
async fn test_shutdown_unloads_topics() {
    let node = standalone();
    let sessions = node.sessions().clone();
    let mut alice = sessions.connect("alice", TransportKind::WebSocket).unwrap();
    sessions.subscribe(alice.id(), "me").await.unwrap();
    assert_eq!(node.hub().len(), 1);

    node.shutdown().await;
    assert!(node.hub().is_empty());
    assert!(sessions.is_empty());
    assert!(matches!(next(&mut alice).await, ServerMessage::Closed { .. }));
}
