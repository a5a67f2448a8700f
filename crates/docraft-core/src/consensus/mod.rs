//! Consensus: follower side of the replication protocol
//!
//! A leader connects, proves it is not stale, agrees with us on the last
//! log position we share, ships a (possibly empty) snapshot and then streams
//! append-entries messages for as long as the connection lives.
//!
//! # Session
//!
//! ```text
//! CheckingLeader ──► Negotiating ──► InstallingSnapshot ──► SteadyState
//!       │                                    │                   │
//!       └──────────────► Terminated ◄────────┴───────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! Typed messages use bincode with CRC32 validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```
//!
//! Snapshot contents follow `InstallSnapshot` as a raw stream (see
//! [`snapshot`]).

pub mod config;
pub mod connection;
pub mod engine;
pub mod follower;
pub mod log;
pub mod negotiation;
pub mod protocol;
pub mod snapshot;
pub mod state_machine;
pub mod timeout;
pub mod topology;

pub use config::ConsensusConfig;
pub use connection::{RemoteConnection, Transport};
pub use engine::{ConsensusEngine, NodeRole};
pub use follower::{Follower, FollowerStats, SessionState};
pub use log::{EntryKind, LogEntry};
pub use negotiation::{NegotiationOutcome, NegotiationWindow};
pub use protocol::{ConsensusMessage, MessageType};
pub use state_machine::{DocumentCommand, DocumentsStateMachine, StateMachine};
pub use timeout::TimeoutEvent;
pub use topology::ClusterTopology;

/// Leadership epoch
pub type Term = u64;

/// Position in the replicated log (first entry is 1)
pub type Index = u64;

/// Default election timeout in milliseconds
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 300;

/// Snapshot items processed between keep-alive checks
pub const DEFAULT_KEEP_ALIVE_BATCH: u64 = 100;

/// Default time a new connection has to send its first message
pub const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 5_000;

/// Largest frame or snapshot field accepted from a peer
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
