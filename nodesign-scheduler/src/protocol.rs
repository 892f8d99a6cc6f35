//! Wire protocol for scheduler communication.
//!
//! Uses a simple length-prefixed binary format over TLS: a 4-byte
//! little-endian length followed by a bincode-encoded message. Each
//! connection carries exactly one request and one response.

use nodesign_signer::{Network, NodeId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors reading or writing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// What a challenge will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeScope {
    Register,
    Recover,
}

/// Request a challenge to sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub node_id: NodeId,
    pub scope: ChallengeScope,
}

/// Enrol a device for a node (used by both register and recover).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    /// Node being enrolled
    pub node_id: NodeId,
    /// Network the node runs on
    pub network: Network,
    /// Challenge previously issued by the scheduler
    pub challenge: Vec<u8>,
    /// Signature over the challenge by the node key
    pub signature: Vec<u8>,
    /// PEM certificate signing request for the device identity
    pub csr: String,
}

/// Result of a successful enrolment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    /// PEM device certificate with CN `/users/<node id>`
    pub device_cert: String,
    /// Access rune for the node
    pub rune: String,
}

/// Request infrastructure for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub node_id: NodeId,
    pub network: Network,
    /// Rune authorizing the call
    pub rune: String,
}

/// Where a node has been provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleResult {
    /// Node the assignment belongs to
    pub node_id: NodeId,
    /// Endpoint the node's RPC interface is reachable at
    pub grpc_uri: String,
    /// Identifier of the scheduling session
    pub session_id: String,
}

impl ScheduleResult {
    pub fn is_empty(&self) -> bool {
        self.grpc_uri.is_empty() || self.session_id.is_empty()
    }
}

/// Error classes reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthenticated,
    Unavailable,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Internal,
}

/// Error returned in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// All possible messages from client to scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Ping,
    GetChallenge(ChallengeRequest),
    Register(EnrollRequest),
    Recover(EnrollRequest),
    Schedule(ScheduleRequest),
    GetNodeInfo { node_id: NodeId, rune: String },
}

impl Request {
    /// Short name of the variant, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::GetChallenge(_) => "GetChallenge",
            Request::Register(_) => "Register",
            Request::Recover(_) => "Recover",
            Request::Schedule(_) => "Schedule",
            Request::GetNodeInfo { .. } => "GetNodeInfo",
        }
    }
}

/// All possible messages from scheduler to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Challenge { challenge: Vec<u8> },
    Enrolled(EnrollResponse),
    Scheduled(ScheduleResult),
    NodeInfo(Option<ScheduleResult>),
    Error(ServiceError),
}

impl Response {
    /// Short name of the variant, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Pong => "Pong",
            Response::Challenge { .. } => "Challenge",
            Response::Enrolled(_) => "Enrolled",
            Response::Scheduled(_) => "Scheduled",
            Response::NodeInfo(_) => "NodeInfo",
            Response::Error(_) => "Error",
        }
    }
}

/// Write one length-prefixed message.
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), FrameError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed message.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(msg_len));
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader.read_exact(&mut msg_buf)?;
    Ok(bincode::deserialize(&msg_buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn node_id() -> NodeId {
        let mut bytes = [0u8; 33];
        bytes[0] = 0x03;
        bytes[1] = 0x11;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn test_schedule_request_through_frame() {
        let req = Request::Schedule(ScheduleRequest {
            node_id: node_id(),
            network: Network::Regtest,
            rune: "rune".to_string(),
        });

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).unwrap();
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let decoded: Request = read_frame(&mut Cursor::new(buf)).unwrap();
        match decoded {
            Request::Schedule(decoded_req) => {
                assert_eq!(decoded_req.node_id, node_id());
                assert_eq!(decoded_req.network, Network::Regtest);
                assert_eq!(decoded_req.rune, "rune");
            }
            _ => panic!("Expected Schedule request"),
        }
    }

    #[test]
    fn test_error_response_through_frame() {
        let resp = Response::Error(ServiceError::new(ErrorCode::Unavailable, "draining"));

        let mut buf = Vec::new();
        write_frame(&mut buf, &resp).unwrap();
        let decoded: Response = read_frame(&mut Cursor::new(buf)).unwrap();

        match decoded {
            Response::Error(err) => {
                assert_eq!(err.code, ErrorCode::Unavailable);
                assert_eq!(err.message, "draining");
            }
            other => panic!("Expected Error response, got {}", other.kind()),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes());
        let result: Result<Request, _> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        let result: Result<Request, _> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_garbage_body_is_serialization_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&[0xff; 4]);
        let result: Result<Request, _> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(FrameError::Serialization(_))));
    }

    #[test]
    fn test_schedule_result_emptiness() {
        let mut result = ScheduleResult {
            node_id: node_id(),
            grpc_uri: "https://node-1.example:443".to_string(),
            session_id: "abcd".to_string(),
        };
        assert!(!result.is_empty());
        result.session_id.clear();
        assert!(result.is_empty());
    }
}
