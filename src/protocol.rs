//! Cluster Protocol
//!
//! Wire messages exchanged directly between exam nodes for clock
//! synchronization and leader election.

use serde::{Deserialize, Serialize};

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ========== Clock Synchronization ==========
    /// Coordinator asks a participant for its current time
    TimeRequest,

    /// Participant's synchronized local time (seconds since epoch)
    TimeResponse {
        node_id: String,
        local_time: f64,
    },

    /// Coordinator pushes a correction
    TimeAdjust {
        amount: f64,
    },

    // ========== Leader Election ==========
    /// Candidate challenges a higher priority peer
    Election {
        from_id: String,
        from_priority: i64,
    },

    /// Higher priority peer tells the candidate to stand down
    ElectionOk {
        from_id: String,
    },

    /// Winner announces itself
    CoordinatorAnnounce {
        leader_id: String,
        priority: i64,
        address: String,
    },

    // ========== Heartbeat ==========
    Heartbeat {
        from_id: String,
        /// Sender's open exam sessions
        active_load: u64,
    },

    // ========== Generic ==========
    /// Acknowledgement
    Ack,

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Request is not valid for this node
    Unsupported,
    /// Node is shutting down
    ShuttingDown,
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
            Message::TimeRequest => "TimeRequest",
            Message::TimeResponse { .. } => "TimeResponse",
            Message::TimeAdjust { .. } => "TimeAdjust",
            Message::Election { .. } => "Election",
            Message::ElectionOk { .. } => "ElectionOk",
            Message::CoordinatorAnnounce { .. } => "CoordinatorAnnounce",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::Ack => "Ack",
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

    /// Largest body accepted from the wire
    pub const MAX_BODY: u32 = 1024 * 1024;

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
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::CoordinatorAnnounce {
            leader_id: "S3".to_string(),
            priority: 3,
            address: "10.0.0.3:7700".to_string(),
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();
        assert_eq!(restored, msg);
        assert_eq!(restored.type_name(), "CoordinatorAnnounce");
    }

    #[test]
    fn test_frame_header() {
        let data = b"time adjust";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(restored.length, data.len() as u32);
        assert_eq!(restored.checksum, crc32fast::hash(data));
    }
}
