//! Network transport for cluster communication
//!
//! Request/response over TCP with length-prefixed postcard frames:
//! - Connection pooling per peer
//! - One reconnect attempt when a pooled connection turns out stale
//! - Timeouts on connect, read and write

use crate::error::{ClusterError, Result};
use crate::node::NodeId;
use crate::observability::NetworkMetrics;
use crate::protocol::{
    decode_request, decode_response, encode_request, encode_response, frame_length, frame_message,
    ClusterRequest, ClusterResponse, MAX_MESSAGE_SIZE,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Serves requests arriving from peers
#[async_trait]
pub trait ClusterHandler: Send + Sync {
    async fn handle(&self, request: ClusterRequest) -> ClusterResponse;
}

/// Sends requests to peers by node name
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: &str, request: ClusterRequest) -> Result<ClusterResponse>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Read timeout for responses
    pub read_timeout: Duration,
    /// Write timeout
    pub write_timeout: Duration,
    /// Idle timeout for server-side connections
    pub idle_timeout: Duration,
    /// Maximum pooled connections per peer
    pub max_connections_per_peer: usize,
    /// Enable TCP nodelay
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            max_connections_per_peer: 4,
            tcp_nodelay: true,
        }
    }
}

/// TCP transport between cluster nodes
pub struct TcpTransport {
    /// Our node name
    local_node: NodeId,

    /// Configuration
    config: TransportConfig,

    /// Connection pool to peers
    connections: DashMap<NodeId, Arc<ConnectionPool>>,

    /// Peer addresses
    peer_addrs: DashMap<NodeId, String>,
}

impl TcpTransport {
    pub fn new(local_node: impl Into<NodeId>, config: TransportConfig) -> Self {
        Self {
            local_node: local_node.into(),
            config,
            connections: DashMap::new(),
            peer_addrs: DashMap::new(),
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Register a peer
    pub fn add_peer(&self, node_id: impl Into<NodeId>, addr: impl Into<String>) {
        self.peer_addrs.insert(node_id.into(), addr.into());
    }

    /// Remove a peer and drop its pooled connections
    pub fn remove_peer(&self, node_id: &str) {
        self.peer_addrs.remove(node_id);
        self.connections.remove(node_id);
    }

    /// Drop pooled connections to a peer, keeping its address
    pub fn reset_peer(&self, node_id: &str) {
        self.connections.remove(node_id);
    }

    /// Accept peer connections on `bind_addr` until `shutdown` fires
    pub async fn serve(
        &self,
        bind_addr: SocketAddr,
        handler: Arc<dyn ClusterHandler>,
        shutdown: CancellationToken,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ClusterError::Network(format!("failed to bind {}: {}", bind_addr, e)))?;
        let local_addr = listener.local_addr()?;

        info!(node = %self.local_node, addr = %local_addr, "Cluster transport listening");

        let config = self.config.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!(peer = %addr, "Accepted cluster connection");
                                let handler = handler.clone();
                                let config = config.clone();
                                let shutdown = shutdown.clone();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        Self::handle_connection(stream, handler, config, shutdown).await
                                    {
                                        debug!(peer = %addr, error = %e, "Cluster connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Accept error");
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Cluster transport shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Serve requests on one inbound connection
    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn ClusterHandler>,
        config: TransportConfig,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        loop {
            let body = tokio::select! {
                body = read_frame(&mut stream, config.idle_timeout) => body,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let body = match body {
                Ok(body) => body,
                Err(ClusterError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            NetworkMetrics::add_bytes_received(body.len() as u64);

            let request = decode_request(&body)?;
            trace!(kind = request.kind(), source = %request.header().source, "Cluster request");
            let response = handler.handle(request).await;

            let bytes = encode_response(&response)?;
            NetworkMetrics::add_bytes_sent(bytes.len() as u64);
            timeout(config.write_timeout, stream.write_all(&frame_message(&bytes)))
                .await
                .map_err(|_| ClusterError::Timeout)?
                .map_err(ClusterError::Io)?;
        }
    }

    /// Send on a pooled connection, retrying once on a fresh one
    async fn send_inner(&self, node_id: &str, bytes: &[u8]) -> Result<ClusterResponse> {
        let addr = self
            .peer_addrs
            .get(node_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?;
        let pool = self
            .connections
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(ConnectionPool::new(self.config.max_connections_per_peer)))
            .clone();

        if let Some(stream) = pool.get().await {
            match self.exchange(stream, bytes).await {
                Ok((response, stream)) => {
                    pool.put(stream).await;
                    return Ok(response);
                }
                Err(e) if e.is_retriable() => {
                    debug!(peer = %node_id, error = %e, "Pooled connection stale, reconnecting");
                }
                Err(e) => return Err(e),
            }
        }

        let stream = self.connect(&addr).await?;
        let (response, stream) = self.exchange(stream, bytes).await?;
        pool.put(stream).await;
        Ok(response)
    }

    async fn exchange(
        &self,
        mut stream: TcpStream,
        bytes: &[u8],
    ) -> Result<(ClusterResponse, TcpStream)> {
        timeout(self.config.write_timeout, stream.write_all(&frame_message(bytes)))
            .await
            .map_err(|_| ClusterError::Timeout)?
            .map_err(ClusterError::Io)?;
        let body = read_frame(&mut stream, self.config.read_timeout).await?;
        NetworkMetrics::add_bytes_received(body.len() as u64);
        Ok((decode_response(&body)?, stream))
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClusterError::Timeout)?
            .map_err(|e| ClusterError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(stream)
    }

    /// Shutdown the transport
    pub fn shutdown(&self) {
        self.connections.clear();
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn send(&self, peer: &str, request: ClusterRequest) -> Result<ClusterResponse> {
        let kind = request.kind();
        let started = Instant::now();
        let bytes = encode_request(&request)?;
        NetworkMetrics::add_bytes_sent(bytes.len() as u64);

        let result = self.send_inner(peer, &bytes).await;
        match &result {
            Ok(_) => NetworkMetrics::record_rpc_latency(kind, started.elapsed()),
            Err(_) => {
                NetworkMetrics::increment_rpc_errors(kind);
                self.reset_peer(peer);
            }
        }
        result
    }
}

/// Read one length-prefixed frame
async fn read_frame(stream: &mut TcpStream, read_timeout: Duration) -> Result<Vec<u8>> {
    let mut length_buf = [0u8; 4];
    match timeout(read_timeout, stream.read_exact(&mut length_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ClusterError::ConnectionClosed);
        }
        Ok(Err(e)) => return Err(ClusterError::Io(e)),
        Err(_) => return Err(ClusterError::Timeout),
    }

    let length = frame_length(&length_buf);
    if length > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size: length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    timeout(read_timeout, stream.read_exact(&mut body))
        .await
        .map_err(|_| ClusterError::Timeout)?
        .map_err(ClusterError::Io)?;
    Ok(body)
}

/// Simple connection pool
struct ConnectionPool {
    connections: Mutex<Vec<TcpStream>>,
    max_size: usize,
}

impl ConnectionPool {
    fn new(max_size: usize) -> Self {
        Self {
            connections: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
        }
    }

    async fn get(&self) -> Option<TcpStream> {
        self.connections.lock().await.pop()
    }

    async fn put(&self, stream: TcpStream) {
        let mut conns = self.connections.lock().await;
        if conns.len() < self.max_size {
            conns.push(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Heartbeat, RequestHeader, ResponseHeader};

    struct EchoEpoch;

    #[async_trait]
    impl ClusterHandler for EchoEpoch {
        async fn handle(&self, request: ClusterRequest) -> ClusterResponse {
            match request {
                ClusterRequest::Heartbeat { header, heartbeat } => ClusterResponse::Heartbeat {
                    header: ResponseHeader::success(header.correlation_id),
                    epoch: heartbeat.epoch + 1,
                },
                other => ClusterResponse::Error {
                    header: ResponseHeader::error(
                        other.header().correlation_id,
                        crate::protocol::StatusCode::InvalidRequest,
                        "unexpected",
                    ),
                },
            }
        }
    }

    fn heartbeat(epoch: u64) -> ClusterRequest {
        ClusterRequest::Heartbeat {
            header: RequestHeader::new(1, "a"),
            heartbeat: Heartbeat {
                sender: "a".to_string(),
                epoch,
                timestamp_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_peer_registration() {
        let transport = TcpTransport::new("a", TransportConfig::default());
        transport.add_peer("b", "127.0.0.1:12002");
        assert!(transport.peer_addrs.contains_key("b"));

        transport.remove_peer("b");
        assert!(!transport.peer_addrs.contains_key("b"));

        let err = transport.send("b", heartbeat(1)).await.unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let shutdown = CancellationToken::new();
        let server = TcpTransport::new("b", TransportConfig::default());
        let addr = server
            .serve("127.0.0.1:0".parse().unwrap(), Arc::new(EchoEpoch), shutdown.clone())
            .await
            .unwrap();

        let client = TcpTransport::new("a", TransportConfig::default());
        client.add_peer("b", addr.to_string());

        for epoch in 0..3 {
            match client.send("b", heartbeat(epoch)).await.unwrap() {
                ClusterResponse::Heartbeat { header, epoch: e } => {
                    assert!(header.is_success());
                    assert_eq!(e, epoch + 1);
                }
                other => panic!("unexpected response: {:?}", other),
            }
        }

        shutdown.cancel();
    }
}
