//! Proxy behaviour against a scripted master on node "b"

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidings_cluster::{
    ClusterConfig, ClusterHandler, ClusterRequest, ClusterResponse, Delivery, DeliveryEvent,
    Envelope, LocalNetwork, LocalTransport, PeerTransport, ProxyOp, ProxyResult, RequestHeader,
    ResponseHeader, Ring, StatusCode, DEFAULT_REPLICAS,
};
use tidingsd::{
    AccessMode, Error, Node, ServerConfig, ServerContext, ServerMessage, SessionHandle,
    TopicName, TransportKind,
};

/// Stands in for the master of every topic owned by "b"
#[derive(Default)]
struct ScriptedMaster {
    /// Set once node "a" exists
    downstream: Option<LocalTransport>,
    subscribe_delay: Duration,
    /// Fan out seq 1 to the subscriber before replying to its subscribe
    deliver_before_reply: bool,
    /// Never answer publishes
    stall_publishes: bool,
    unsubscribes: AtomicUsize,
}

#[async_trait]
impl ClusterHandler for ScriptedMaster {
    async fn handle(&self, request: ClusterRequest) -> ClusterResponse {
        let correlation_id = request.header().correlation_id;
        let ClusterRequest::Proxy { request, .. } = request else {
            return ClusterResponse::Error {
                header: ResponseHeader::error(correlation_id, StatusCode::InvalidRequest, "proxy calls only"),
            };
        };
        let result = match request.op {
            ProxyOp::Subscribe => {
                tokio::time::sleep(self.subscribe_delay).await;
                let mut last_seq = 0;
                if let (true, Some(downstream)) = (self.deliver_before_reply, &self.downstream) {
                    last_seq = 1;
                    let delivery = Delivery {
                        topic: request.topic.clone(),
                        recipients: vec![request.session.session_id],
                        event: DeliveryEvent::Data(Envelope {
                            topic: request.topic.clone(),
                            sender: "carol".into(),
                            seq: 1,
                            timestamp_ms: 0,
                            payload: Bytes::from_static(b"early"),
                        }),
                    };
                    let response = downstream
                        .send(
                            "a",
                            ClusterRequest::Deliver {
                                header: RequestHeader::new(correlation_id + 1000, "b"),
                                delivery,
                            },
                        )
                        .await
                        .unwrap();
                    assert!(response.header().is_success());
                }
                ProxyResult::Subscribed {
                    mode: AccessMode::GROUP_MEMBER.bits(),
                    last_seq,
                }
            }
            ProxyOp::Unsubscribe => {
                self.unsubscribes.fetch_add(1, Ordering::SeqCst);
                ProxyResult::Done
            }
            ProxyOp::Publish { .. } if self.stall_publishes => {
                std::future::pending::<()>().await;
                ProxyResult::Done
            }
            ProxyOp::Publish { .. } => ProxyResult::Published {
                seq: 1,
                duplicate: false,
            },
            _ => ProxyResult::Done,
        };
        ClusterResponse::proxied(correlation_id, result)
    }
}

struct Pair {
    node: Arc<Node>,
    master: Arc<ScriptedMaster>,
    topic: String,
    _handlers: Vec<Arc<dyn ClusterHandler>>,
}

/// Node "a" (not started, so "b" stays in its ring) and a scripted "b"
fn pair(config: impl FnOnce(&mut ServerConfig), master: ScriptedMaster) -> Pair {
    let mut server = ServerConfig::default();
    server.cluster = ClusterConfig::builder()
        .node("a", "a:1")
        .node("b", "b:1")
        .this_name("a")
        .build()
        .unwrap();
    config(&mut server);

    let net = LocalNetwork::new();
    let ctx = ServerContext::from_config(server).unwrap();
    let node = Node::new(ctx, Arc::new(net.endpoint("a"))).unwrap();
    let master = Arc::new(ScriptedMaster {
        downstream: Some(net.endpoint("b")),
        ..master
    });

    let a: Arc<dyn ClusterHandler> = node.clone();
    let b: Arc<dyn ClusterHandler> = master.clone();
    net.register("a", Arc::downgrade(&a));
    net.register("b", Arc::downgrade(&b));

    let ring = Ring::new(["a", "b"], DEFAULT_REPLICAS);
    let topic = (0..1000)
        .map(|i| format!("grp{}", i))
        .find(|name| ring.owner(name) == Some("b"))
        .unwrap();
    Pair {
        node,
        master,
        topic,
        _handlers: vec![a, b],
    }
}

async fn next(handle: &mut SessionHandle) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), handle.outbound.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_fan_out_ahead_of_subscribe_reply_is_delivered() {
    let pair = pair(
        |_| {},
        ScriptedMaster {
            deliver_before_reply: true,
            ..Default::default()
        },
    );
    let sessions = pair.node.sessions().clone();
    let mut alice = sessions.connect("alice", TransportKind::WebSocket).unwrap();

    let sub = sessions.subscribe(alice.id(), &pair.topic).await.unwrap();
    assert_eq!(sub.last_seq, 1);
    match next(&mut alice).await {
        ServerMessage::Data(envelope) => {
            assert_eq!(envelope.seq, 1);
            assert_eq!(&envelope.payload[..], b"early");
        }
        other => panic!("unexpected message {:?}", other),
    }

    let name = TopicName::from_routing(&pair.topic).unwrap();
    let stats = pair.node.hub().topic_stats(&name).await.unwrap();
    assert_eq!(stats.local_subscribers, 1);
    assert_eq!(stats.last_seq, 1);
}

#[tokio::test(start_paused = true)]
async fn test_session_closed_mid_subscribe_lets_proxy_unload() {
    let pair = pair(
        |_| {},
        ScriptedMaster {
            subscribe_delay: Duration::from_millis(100),
            ..Default::default()
        },
    );
    let sessions = pair.node.sessions().clone();
    let alice = sessions.connect("alice", TransportKind::WebSocket).unwrap();
    let name = TopicName::from_routing(&pair.topic).unwrap();

    let subscribe = {
        let sessions = sessions.clone();
        let topic = pair.topic.clone();
        let id = alice.id();
        tokio::spawn(async move { sessions.subscribe(id, &topic).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    sessions.disconnect(alice.id());
    assert!(matches!(subscribe.await.unwrap(), Err(Error::SessionClosed)));

    // The reply still arrives; the proxy undoes the attachment upstream
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = pair.node.hub().topic_stats(&name).await.unwrap();
    assert_eq!(stats.local_subscribers, 0);
    assert_eq!(pair.master.unsubscribes.load(Ordering::SeqCst), 1);

    let proxy_idle = pair.node.context().timeouts().proxy_idle;
    tokio::time::sleep(proxy_idle).await;
    assert!(pair.node.hub().handle(&name).is_none());
}

#[tokio::test]
async fn test_upstream_queue_overflow_is_retriable() {
    let pair = pair(
        |config| config.limits.max_pending_upstream = 2,
        ScriptedMaster {
            stall_publishes: true,
            ..Default::default()
        },
    );
    let sessions = pair.node.sessions().clone();
    let mut alice = sessions.connect("alice", TransportKind::WebSocket).unwrap();
    sessions.subscribe(alice.id(), &pair.topic).await.unwrap();

    // One call in flight, one queued, the third does not fit
    for _ in 0..3 {
        sessions
            .publish(alice.id(), &pair.topic, Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    match next(&mut alice).await {
        ServerMessage::Ack {
            client_seq, result, ..
        } => {
            assert_eq!(client_seq, 3);
            let reply = result.unwrap_err();
            assert_eq!(reply.status, StatusCode::OwnershipTransient);
            assert!(reply.status.is_retriable());
        }
        other => panic!("unexpected message {:?}", other),
    }

    let name = TopicName::from_routing(&pair.topic).unwrap();
    let stats = pair.node.hub().topic_stats(&name).await.unwrap();
    assert_eq!(stats.pending, 2);
}
