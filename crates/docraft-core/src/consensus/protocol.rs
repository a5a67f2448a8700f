//! Consensus wire protocol
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]

use super::log::LogEntry;
use super::topology::ClusterTopology;
use super::{Index, MAX_MESSAGE_SIZE, Term};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Header: type(1) + length(4)
const HEADER_LEN: usize = 5;
const CRC_LEN: usize = 4;

/// Consensus message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Leader proposes the log position to agree on
    LogLengthNegotiation = 0x01,
    /// Follower answers a negotiation round
    LogLengthNegotiationResponse = 0x02,
    /// Snapshot header (raw stream follows)
    InstallSnapshot = 0x10,
    /// Snapshot progress or completion
    InstallSnapshotResponse = 0x11,
    /// Append entries header (entries follow)
    AppendEntries = 0x20,
    /// Append entries acknowledgment
    AppendEntriesResponse = 0x21,
    /// A single log entry
    Entry = 0x22,
    /// Error message
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::LogLengthNegotiation),
            0x02 => Ok(Self::LogLengthNegotiationResponse),
            0x10 => Ok(Self::InstallSnapshot),
            0x11 => Ok(Self::InstallSnapshotResponse),
            0x20 => Ok(Self::AppendEntries),
            0x21 => Ok(Self::AppendEntriesResponse),
            0x22 => Ok(Self::Entry),
            0xFF => Ok(Self::Error),
            _ => Err(Error::protocol(format!("Unknown message type: {}", value))),
        }
    }
}

/// Leader's claim: "my log agrees with yours at (prev_log_index, prev_log_term)"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLengthNegotiation {
    /// Leader term
    pub term: Term,
    /// Proposed agreement index
    pub prev_log_index: Index,
    /// Leader's term at that index
    pub prev_log_term: Term,
}

/// Negotiation answer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationStatus {
    /// Stale leader
    Rejected,
    /// Agreement reached at `last_log_index`
    Acceptable,
    /// Keep searching, see the window fields
    Negotiation,
}

/// Follower's answer to a negotiation round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLengthNegotiationResponse {
    /// Outcome of this round
    pub status: NegotiationStatus,
    /// Diagnostic text
    pub message: String,
    /// Follower's current term
    pub current_term: Term,
    /// Agreed index (Acceptable only)
    pub last_log_index: Index,
    /// Search window lower bound
    pub min_index: Index,
    /// Search window upper bound
    pub max_index: Index,
    /// Index the leader should report its term for
    pub midpoint_index: Index,
    /// Follower's term at the midpoint
    pub midpoint_term: Term,
}

impl LogLengthNegotiationResponse {
    /// Rejection of a stale leader
    pub fn rejected(current_term: Term, message: impl Into<String>) -> Self {
        Self {
            status: NegotiationStatus::Rejected,
            message: message.into(),
            current_term,
            last_log_index: 0,
            min_index: 0,
            max_index: 0,
            midpoint_index: 0,
            midpoint_term: 0,
        }
    }

    /// Agreement at `last_log_index`
    pub fn acceptable(current_term: Term, last_log_index: Index, message: impl Into<String>) -> Self {
        Self {
            status: NegotiationStatus::Acceptable,
            message: message.into(),
            current_term,
            last_log_index,
            min_index: 0,
            max_index: 0,
            midpoint_index: 0,
            midpoint_term: 0,
        }
    }
}

/// Snapshot header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    /// Leader term
    pub term: Term,
    /// Last log index covered by the snapshot
    pub last_included_index: Index,
    /// Term of that entry
    pub last_included_term: Term,
    /// Topology at that point (mandatory)
    pub topology: Option<ClusterTopology>,
}

/// Snapshot progress (`done = false`) or completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Installation finished
    pub done: bool,
    /// Follower's current term
    pub current_term: Term,
    /// Follower's last log index
    pub last_log_index: Index,
}

/// Append entries header; `entries_count` Entry messages follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// Leader term
    pub term: Term,
    /// Index preceding the first entry
    pub prev_log_index: Index,
    /// Leader's commit index
    pub leader_commit: Index,
    /// Entries before this index may be dropped
    pub truncate_log_before: Index,
    /// Number of entries that follow
    pub entries_count: u32,
}

/// Append entries acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term
    pub current_term: Term,
    /// Follower's last log index
    pub last_log_index: Index,
    /// Whether the entries were accepted
    pub success: bool,
}

/// Consensus messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// See [`LogLengthNegotiation`]
    LogLengthNegotiation(LogLengthNegotiation),
    /// See [`LogLengthNegotiationResponse`]
    LogLengthNegotiationResponse(LogLengthNegotiationResponse),
    /// See [`InstallSnapshot`]
    InstallSnapshot(InstallSnapshot),
    /// See [`InstallSnapshotResponse`]
    InstallSnapshotResponse(InstallSnapshotResponse),
    /// See [`AppendEntries`]
    AppendEntries(AppendEntries),
    /// See [`AppendEntriesResponse`]
    AppendEntriesResponse(AppendEntriesResponse),
    /// A log entry following [`AppendEntries`]
    Entry(LogEntry),
    /// Fault report; the sender closes the connection afterwards
    Error {
        /// Description
        message: String,
    },
}

impl ConsensusMessage {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::LogLengthNegotiation(_) => MessageType::LogLengthNegotiation,
            Self::LogLengthNegotiationResponse(_) => MessageType::LogLengthNegotiationResponse,
            Self::InstallSnapshot(_) => MessageType::InstallSnapshot,
            Self::InstallSnapshotResponse(_) => MessageType::InstallSnapshotResponse,
            Self::AppendEntries(_) => MessageType::AppendEntries,
            Self::AppendEntriesResponse(_) => MessageType::AppendEntriesResponse,
            Self::Entry(_) => MessageType::Entry,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::protocol(format!(
                "Message of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + CRC_LEN {
            return Err(Error::protocol("Message too short"));
        }

        // Verify CRC
        let crc_offset = buf.len() - CRC_LEN;
        let stored_crc = read_u32_le(&buf[crc_offset..])?;

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let message_type = MessageType::try_from(buf[0])?;
        let length = read_u32_le(&buf[1..HEADER_LEN])? as usize;
        if buf.len() != HEADER_LEN + length + CRC_LEN {
            return Err(Error::protocol(format!(
                "Frame length mismatch: header says {} payload bytes, frame has {}",
                length,
                buf.len() - HEADER_LEN - CRC_LEN
            )));
        }

        let message: Self = bincode::deserialize(&buf[HEADER_LEN..crc_offset])?;
        if message.message_type() != message_type {
            return Err(Error::protocol(format!(
                "Frame tagged {:?} carries {:?}",
                message_type,
                message.message_type()
            )));
        }
        Ok(message)
    }

    /// Write message to a stream
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Read message from a stream
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;

        MessageType::try_from(header[0])?;
        let length = read_u32_le(&header[1..])? as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::protocol(format!(
                "Message of {} bytes exceeds the {} byte limit",
                length, MAX_MESSAGE_SIZE
            )));
        }

        // Payload + CRC
        let mut frame = vec![0u8; HEADER_LEN + length + CRC_LEN];
        frame[..HEADER_LEN].copy_from_slice(&header);
        reader.read_exact(&mut frame[HEADER_LEN..])?;

        Self::decode(&frame)
    }
}

fn read_u32_le(bytes: &[u8]) -> Result<u32> {
    let array: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::protocol("Truncated frame"))?;
    Ok(u32::from_le_bytes(array))
}

/// Typed access to a message variant
pub trait ProtocolMessage: Sized {
    /// Variant name used in diagnostics
    const NAME: &'static str;

    /// Wrap into the message enum
    fn into_message(self) -> ConsensusMessage;

    /// Unwrap from the message enum
    fn from_message(message: ConsensusMessage) -> Result<Self>;
}

macro_rules! protocol_message {
    ($($ty:ident),* $(,)?) => {
        $(
            impl ProtocolMessage for $ty {
                const NAME: &'static str = stringify!($ty);

                fn into_message(self) -> ConsensusMessage {
                    ConsensusMessage::$ty(self)
                }

                fn from_message(message: ConsensusMessage) -> Result<Self> {
                    match message {
                        ConsensusMessage::$ty(inner) => Ok(inner),
                        ConsensusMessage::Error { message } => Err(Error::protocol(format!(
                            "Peer reported an error while {} was expected: {}",
                            Self::NAME,
                            message
                        ))),
                        other => Err(Error::protocol(format!(
                            "Expected {}, got {:?}",
                            Self::NAME,
                            other.message_type()
                        ))),
                    }
                }
            }
        )*
    };
}

protocol_message!(
    LogLengthNegotiation,
    LogLengthNegotiationResponse,
    InstallSnapshot,
    InstallSnapshotResponse,
    AppendEntries,
    AppendEntriesResponse,
);

impl ProtocolMessage for LogEntry {
    const NAME: &'static str = "Entry";

    fn into_message(self) -> ConsensusMessage {
        ConsensusMessage::Entry(self)
    }

    fn from_message(message: ConsensusMessage) -> Result<Self> {
        match message {
            ConsensusMessage::Entry(entry) => Ok(entry),
            other => Err(Error::protocol(format!(
                "Expected Entry, got {:?}",
                other.message_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiation() -> ConsensusMessage {
        ConsensusMessage::LogLengthNegotiation(LogLengthNegotiation {
            term: 3,
            prev_log_index: 50,
            prev_log_term: 2,
        })
    }

    #[test]
    fn test_message_encode_decode() {
        let msg = negotiation();
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], MessageType::LogLengthNegotiation as u8);
        assert_eq!(ConsensusMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_stream_read_write() {
        let entry = LogEntry::command(7, 2, b"{\"op\":1}".to_vec());
        let mut buf = Vec::new();
        negotiation().write_to(&mut buf).unwrap();
        entry.clone().into_message().write_to(&mut buf).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(ConsensusMessage::read_from(&mut cursor).unwrap(), negotiation());
        let read = LogEntry::from_message(ConsensusMessage::read_from(&mut cursor).unwrap()).unwrap();
        assert_eq!(read, entry);
    }

    #[test]
    fn test_crc_validation() {
        let mut encoded = negotiation().encode().unwrap();

        // Corrupt the data
        encoded[5] ^= 0xFF;

        let result = ConsensusMessage::decode(&encoded);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_type_byte_must_match_payload() {
        let mut encoded = negotiation().encode().unwrap();
        encoded[0] = MessageType::AppendEntries as u8;
        // Recompute the CRC so only the tag is wrong
        let crc_offset = encoded.len() - 4;
        let crc = crc32fast::hash(&encoded[..crc_offset]);
        encoded[crc_offset..].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            ConsensusMessage::decode(&encoded),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_before_allocation() {
        let mut header = vec![MessageType::Entry as u8];
        header.extend_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(header);
        assert!(matches!(
            ConsensusMessage::read_from(&mut cursor),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_type() {
        assert!(MessageType::try_from(0x42).is_err());
        assert_eq!(MessageType::try_from(0xFF).unwrap(), MessageType::Error);
    }

    #[test]
    fn test_typed_unwrap() {
        let response = AppendEntriesResponse {
            current_term: 1,
            last_log_index: 9,
            success: true,
        };
        let message = response.clone().into_message();
        assert_eq!(AppendEntriesResponse::from_message(message).unwrap(), response);

        let err = AppendEntries::from_message(ConsensusMessage::Error {
            message: "boom".into(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(AppendEntries::from_message(negotiation()).is_err());
    }
}
