//! Wire protocol for inter-node communication
//!
//! Three request kinds travel between nodes:
//! - `Heartbeat`: failure detector liveness signal
//! - `Proxy`: a session action forwarded from a proxy topic to the master
//! - `Deliver`: a master pushing topic events to the sessions of one node
//!
//! Messages are postcard-encoded and framed with a 4-byte big-endian length.

use crate::error::{ClusterError, Result};
use crate::node::NodeId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum protocol version we can interoperate with
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Maximum frame size (4 MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Request header included in all requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Protocol version
    pub version: u16,
    /// Correlation ID for matching responses
    pub correlation_id: u64,
    /// Sending node
    pub source: NodeId,
    /// Request timeout
    pub timeout_ms: u32,
}

impl RequestHeader {
    pub fn new(correlation_id: u64, source: impl Into<NodeId>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            source: source.into(),
            timeout_ms: 5000,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        self
    }

    /// Validate that the protocol version is supported.
    pub fn validate_version(&self) -> std::result::Result<(), ResponseHeader> {
        if self.version < MIN_PROTOCOL_VERSION || self.version > PROTOCOL_VERSION {
            Err(ResponseHeader::error(
                self.correlation_id,
                StatusCode::UnsupportedVersion,
                format!(
                    "unsupported protocol version {}: supported range [{}, {}]",
                    self.version, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION
                ),
            ))
        } else {
            Ok(())
        }
    }
}

/// Response header included in all responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Correlation ID matching the request
    pub correlation_id: u64,
    /// Outcome of the request
    pub status: StatusCode,
    /// Error detail, if any
    pub message: Option<String>,
}

impl ResponseHeader {
    pub fn success(correlation_id: u64) -> Self {
        Self {
            correlation_id,
            status: StatusCode::Ok,
            message: None,
        }
    }

    pub fn error(correlation_id: u64, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            status,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Ok
    }
}

/// Status codes carried in response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0,
    Unknown = 1,
    NotFound = 2,
    PermissionDenied = 3,
    Backpressure = 4,
    /// Receiver does not own the topic under its current ring
    NotOwner = 5,
    /// Topic is loading, unloading or changing hands
    OwnershipTransient = 6,
    Validation = 7,
    Store = 8,
    UnsupportedVersion = 9,
    InvalidRequest = 10,
    Unavailable = 11,
}

impl StatusCode {
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            StatusCode::Backpressure
                | StatusCode::NotOwner
                | StatusCode::OwnershipTransient
                | StatusCode::Unavailable
        )
    }

    /// Failures that call for re-resolving the topic owner
    pub fn is_ownership(self) -> bool {
        matches!(self, StatusCode::NotOwner | StatusCode::OwnershipTransient)
    }
}

/// Liveness signal sent by each node to every peer once per heartbeat period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender: NodeId,
    /// Sender's ring epoch
    pub epoch: u64,
    /// Sender's wall clock, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Identity of a client session on its home node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: Uuid,
    /// Authenticated user
    pub principal: String,
    /// Node the session is attached to
    pub origin: NodeId,
}

/// Operations a proxy forwards to the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyOp {
    Subscribe,
    Unsubscribe,
    Publish { payload: Bytes },
    /// Delete the persisted subscription
    Leave,
    MarkRead { seq: u64 },
    History { since: u64, limit: u32 },
    /// Change another principal's access mode (bits of the access mask)
    SetAccess { target: String, mode: u8 },
}

impl ProxyOp {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyOp::Subscribe => "sub",
            ProxyOp::Unsubscribe => "unsub",
            ProxyOp::Publish { .. } => "pub",
            ProxyOp::Leave => "leave",
            ProxyOp::MarkRead { .. } => "read",
            ProxyOp::History { .. } => "get",
            ProxyOp::SetAccess { .. } => "set",
        }
    }
}

/// Session action forwarded upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Routing name of the topic
    pub topic: String,
    pub op: ProxyOp,
    pub session: SessionRef,
    /// Per-session monotonic sequence; (session_id, client_seq) is the
    /// idempotency key for retried publishes
    pub client_seq: u64,
}

/// Successful outcome of a proxied operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyResult {
    Subscribed { mode: u8, last_seq: u64 },
    Published { seq: u64, duplicate: bool },
    Done,
    History(Vec<Envelope>),
}

/// A stored topic message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub sender: String,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

/// Event pushed by a master to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// New message for the listed sessions
    Data(Envelope),
    /// The master dropped this session's attachment
    Detached { session_id: Uuid, reason: StatusCode },
}

/// Downstream delivery for sessions on the receiving node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub topic: String,
    /// Sessions on the receiving node that should see the event
    pub recipients: Vec<Uuid>,
    pub event: DeliveryEvent,
}

/// Request types for cluster operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterRequest {
    Heartbeat {
        header: RequestHeader,
        heartbeat: Heartbeat,
    },
    Proxy {
        header: RequestHeader,
        request: ProxyRequest,
    },
    Deliver {
        header: RequestHeader,
        delivery: Delivery,
    },
}

impl ClusterRequest {
    pub fn header(&self) -> &RequestHeader {
        match self {
            ClusterRequest::Heartbeat { header, .. }
            | ClusterRequest::Proxy { header, .. }
            | ClusterRequest::Deliver { header, .. } => header,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClusterRequest::Heartbeat { .. } => "heartbeat",
            ClusterRequest::Proxy { .. } => "proxy",
            ClusterRequest::Deliver { .. } => "deliver",
        }
    }
}

/// Response types for cluster operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterResponse {
    Heartbeat {
        header: ResponseHeader,
        epoch: u64,
    },
    Proxy {
        header: ResponseHeader,
        result: Option<ProxyResult>,
    },
    Delivered {
        header: ResponseHeader,
    },
    /// Generic error response
    Error {
        header: ResponseHeader,
    },
}

impl ClusterResponse {
    pub fn header(&self) -> &ResponseHeader {
        match self {
            ClusterResponse::Heartbeat { header, .. }
            | ClusterResponse::Proxy { header, .. }
            | ClusterResponse::Delivered { header }
            | ClusterResponse::Error { header } => header,
        }
    }

    /// Successful proxy response
    pub fn proxied(correlation_id: u64, result: ProxyResult) -> Self {
        ClusterResponse::Proxy {
            header: ResponseHeader::success(correlation_id),
            result: Some(result),
        }
    }

    /// Failed proxy response
    pub fn proxy_failed(correlation_id: u64, status: StatusCode, message: impl Into<String>) -> Self {
        ClusterResponse::Proxy {
            header: ResponseHeader::error(correlation_id, status, message),
            result: None,
        }
    }
}

/// Encode a request to bytes
pub fn encode_request(request: &ClusterRequest) -> Result<Vec<u8>> {
    let bytes =
        postcard::to_allocvec(request).map_err(|e| ClusterError::Serialization(e.to_string()))?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Decode a request from bytes
pub fn decode_request(bytes: &[u8]) -> Result<ClusterRequest> {
    check_size(bytes.len())?;
    postcard::from_bytes(bytes).map_err(|e| ClusterError::Deserialization(e.to_string()))
}

/// Encode a response to bytes
pub fn encode_response(response: &ClusterResponse) -> Result<Vec<u8>> {
    let bytes =
        postcard::to_allocvec(response).map_err(|e| ClusterError::Serialization(e.to_string()))?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Decode a response from bytes
pub fn decode_response(bytes: &[u8]) -> Result<ClusterResponse> {
    check_size(bytes.len())?;
    postcard::from_bytes(bytes).map_err(|e| ClusterError::Deserialization(e.to_string()))
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u32;
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(data);
    framed
}

/// Extract message length from frame header
pub fn frame_length(header: &[u8; 4]) -> usize {
    u32::from_be_bytes(*header) as usize
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionRef {
        SessionRef {
            session_id: Uuid::new_v4(),
            principal: "alice".to_string(),
            origin: "a".to_string(),
        }
    }

    #[test]
    fn test_proxy_request_roundtrip() {
        let request = ClusterRequest::Proxy {
            header: RequestHeader::new(42, "a"),
            request: ProxyRequest {
                topic: "grpX".to_string(),
                op: ProxyOp::Publish {
                    payload: Bytes::from_static(b"hi"),
                },
                session: session(),
                client_seq: 7,
            },
        };

        let bytes = encode_request(&request).unwrap();
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.header().correlation_id, 42);
        assert_eq!(decoded.kind(), "proxy");
    }

    #[test]
    fn test_failed_proxy_response() {
        let response = ClusterResponse::proxy_failed(9, StatusCode::NotOwner, "owner is c");
        let bytes = encode_response(&response).unwrap();
        let decoded = decode_response(&bytes).unwrap();

        let header = decoded.header();
        assert!(!header.is_success());
        assert_eq!(header.status, StatusCode::NotOwner);
        assert_eq!(header.message.as_deref(), Some("owner is c"));
        assert!(header.status.is_retriable());
        assert!(header.status.is_ownership());
    }

    #[test]
    fn test_delivery_roundtrip() {
        let sid = Uuid::new_v4();
        let request = ClusterRequest::Deliver {
            header: RequestHeader::new(1, "b"),
            delivery: Delivery {
                topic: "grpX".to_string(),
                recipients: vec![sid],
                event: DeliveryEvent::Data(Envelope {
                    topic: "grpX".to_string(),
                    sender: "alice".to_string(),
                    seq: 3,
                    timestamp_ms: 1_700_000_000_000,
                    payload: Bytes::from_static(b"{\"txt\":\"hi\"}"),
                }),
            },
        };
        let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let err = decode_request(&big).unwrap_err();
        assert!(matches!(err, ClusterError::MessageTooLarge { .. }));
    }

    #[test]
    fn test_framing() {
        let data = b"hello world";
        let framed = frame_message(data);

        assert_eq!(framed.len(), 4 + data.len());

        let mut header = [0u8; 4];
        header.copy_from_slice(&framed[..4]);
        assert_eq!(frame_length(&header), data.len());
    }

    #[test]
    fn test_version_validation() {
        let header = RequestHeader::new(1, "a");
        assert!(header.validate_version().is_ok());

        let mut header = RequestHeader::new(1, "a");
        header.version = PROTOCOL_VERSION + 1;
        let err = header.validate_version().unwrap_err();
        assert_eq!(err.status, StatusCode::UnsupportedVersion);

        header.version = 0;
        assert!(header.validate_version().is_err());
    }

    #[test]
    fn test_status_codes() {
        assert!(StatusCode::Backpressure.is_retriable());
        assert!(!StatusCode::Backpressure.is_ownership());
        assert!(!StatusCode::PermissionDenied.is_retriable());
        assert!(!StatusCode::Store.is_retriable());
    }
}
