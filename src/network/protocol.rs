//! Cluster Protocol
//!
//! Defines the wire protocol spoken between peer daemons and by the
//! administrative layer: leader election, heartbeats, health checks, status
//! queries, and membership changes.

use serde::{Deserialize, Serialize};

use crate::state::Role;

/// A MySQL binlog coordinate.
///
/// Binlog file names sort lexicographically (`mysql-bin.000007` <
/// `mysql-bin.000010`), so the derived ordering over (file, offset) matches
/// replication progress.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog file name
    pub file: String,
    /// Byte offset within the file
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// Liveness code returned by Ping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessCode {
    /// Node and its local MySQL are healthy
    Ok,
    /// Node is up but its MySQL probe is failing
    Degraded,
}

/// A cluster member as carried in heartbeat payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub address: String,
    pub voting: bool,
}

/// A peer as reported by GetNodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    pub role: Role,
}

/// Per-peer detail reported by GetStatus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub address: String,
    pub role: Role,
    pub voting: bool,
    pub suspected: bool,
    /// Milliseconds since the last successful contact, if any
    pub last_contact_ms: Option<u64>,
    /// When the peer entered the configuration
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Leader Election ==========
    /// Request a vote for `candidate` in `term`
    VoteRequest {
        term: u64,
        candidate: String,
        position: BinlogPosition,
    },

    /// Vote response
    VoteResponse {
        term: u64,
        voter: String,
        granted: bool,
    },

    // ========== Heartbeat ==========
    /// Leader heartbeat: role assertion plus membership propagation
    Heartbeat {
        term: u64,
        leader: String,
        /// Leader's current binlog position hint
        position: Option<BinlogPosition>,
        config_version: u64,
        members: Vec<MemberEntry>,
    },

    /// Heartbeat acknowledgement
    HeartbeatResponse {
        term: u64,
        node: String,
        success: bool,
        /// Replication position this follower still requires
        position: Option<BinlogPosition>,
    },

    // ========== Health ==========
    /// Liveness probe
    Ping,

    /// Liveness reply
    Pong { code: LivenessCode },

    // ========== Status ==========
    /// Status query
    StatusRequest,

    /// Status reply
    StatusResponse {
        node: String,
        role: Role,
        term: u64,
        leader: Option<String>,
        config_version: u64,
        peers: Vec<PeerStatus>,
        degraded: bool,
        replication_inconsistent: bool,
    },

    /// Node list query
    NodesRequest,

    /// Node list reply
    NodesResponse { nodes: Vec<NodeEntry> },

    // ========== Membership ==========
    /// Add nodes to the cluster configuration (leader only)
    AddNode { addresses: Vec<String> },

    /// Remove nodes from the cluster configuration (leader only)
    RemoveNode { addresses: Vec<String> },

    /// Membership change acknowledgement
    MembershipResponse { version: u64 },

    // ========== Error ==========
    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Operation requires the leader; redirect the caller
    NotLeader,
    /// Reconfiguration blocked by an in-flight election
    Busy,
    /// Node has halted participation (persistence failure)
    Halted,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::VoteRequest { .. } => "VoteRequest",
            Message::VoteResponse { .. } => "VoteResponse",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatResponse { .. } => "HeartbeatResponse",
            Message::Ping => "Ping",
            Message::Pong { .. } => "Pong",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
            Message::NodesRequest => "NodesRequest",
            Message::NodesResponse { .. } => "NodesResponse",
            Message::AddNode { .. } => "AddNode",
            Message::RemoveNode { .. } => "RemoveNode",
            Message::MembershipResponse { .. } => "MembershipResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest frame a peer may send; membership lists are small, so anything
    /// beyond this is a corrupt or hostile stream
    pub const MAX_FRAME: u32 = 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::VoteRequest {
            term: 7,
            candidate: "10.0.0.1:7650".to_string(),
            position: BinlogPosition::new("mysql-bin.000004", 1932),
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::VoteRequest { term, candidate, position } => {
                assert_eq!(term, 7);
                assert_eq!(candidate, "10.0.0.1:7650");
                assert_eq!(position, BinlogPosition::new("mysql-bin.000004", 1932));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_position_ordering() {
        let a = BinlogPosition::new("mysql-bin.000004", 1932);
        let b = BinlogPosition::new("mysql-bin.000004", 2000);
        let c = BinlogPosition::new("mysql-bin.000010", 4);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_frame_header() {
        let data = b"vote request payload";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
