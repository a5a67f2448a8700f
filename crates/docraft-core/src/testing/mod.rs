//! Testing infrastructure for Docraft Core
//!
//! - **TestContext**: temporary directory with cleanup on drop
//! - **TestNode**: storage, document store and consensus engine over a
//!   fresh directory
//! - **LeaderPeer**: the leader end of a loopback connection, for driving a
//!   follower session message by message
//!
//! # Usage
//!
//! ```rust,no_run
//! use docraft_core::consensus::Follower;
//! use docraft_core::testing::{LeaderPeer, TestNode};
//!
//! let node = TestNode::new();
//! let (leader, connection) = LeaderPeer::connect();
//! let follower = Follower::new(node.engine.clone(), connection);
//! // leader.send(...), follower.try_accept_connection(), ...
//! ```

mod context;

pub use context::TestContext;

use crate::consensus::connection::RemoteConnection;
use crate::consensus::log::LogEntry;
use crate::consensus::protocol::{AppendEntries, InstallSnapshot, ProtocolMessage};
use crate::consensus::snapshot::{self, SnapshotWriter};
use crate::consensus::{ConsensusConfig, ConsensusEngine, DocumentsStateMachine};
use crate::documents::DocumentsStorage;
use crate::storage::{StorageConfig, StorageEnvironment};
use crate::Result;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Map size for test environments
pub const TEST_MAP_SIZE: usize = 64 * 1024 * 1024;

/// A single node over its own temporary directory
///
/// Dropping the node shuts the engine down, which ends any follower session
/// and releases the storage environment.
pub struct TestNode {
    ctx: Option<TestContext>,
    config: ConsensusConfig,
    /// Storage environment
    pub storage: Arc<StorageEnvironment>,
    /// Document store
    pub documents: Arc<DocumentsStorage>,
    /// Consensus engine
    pub engine: Arc<ConsensusEngine>,
}

impl TestNode {
    /// Node with a 5s election timeout, long enough to never fire in tests
    pub fn new() -> Self {
        Self::with_config(
            ConsensusConfig::node("tcp://127.0.0.1:0").with_election_timeout(Duration::from_secs(5)),
        )
    }

    /// Node with a custom consensus configuration
    pub fn with_config(config: ConsensusConfig) -> Self {
        Self::open(TestContext::new(), config)
    }

    fn open(ctx: TestContext, config: ConsensusConfig) -> Self {
        let storage = Arc::new(
            StorageEnvironment::open(&StorageConfig::at(ctx.path()).with_map_size(TEST_MAP_SIZE))
                .expect("Failed to open test storage"),
        );
        let documents =
            Arc::new(DocumentsStorage::open(Arc::clone(&storage)).expect("Failed to open documents"));
        let state_machine = Arc::new(DocumentsStateMachine::new(Arc::clone(&documents)));
        let engine = ConsensusEngine::open(config.clone(), Arc::clone(&storage), state_machine)
            .expect("Failed to open consensus engine");

        Self {
            ctx: Some(ctx),
            config,
            storage,
            documents,
            engine,
        }
    }

    /// Close everything and open it again over the same directory
    pub fn reopen(mut self) -> Self {
        let ctx = self.ctx.take().expect("TestNode without context");
        let config = self.config.clone();
        // The environment must be fully released before it can be reopened
        drop(self);
        Self::open(ctx, config)
    }

    /// Snapshot stream of everything this node stores
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.storage.read_txn().expect("Failed to open read txn");
        snapshot::write_snapshot(&self.storage, &txn, Vec::new()).expect("Failed to write snapshot")
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

/// Snapshot stream saying "nothing to install"
pub fn empty_snapshot() -> Vec<u8> {
    SnapshotWriter::new(Vec::new())
        .write_noop()
        .expect("Failed to write empty snapshot")
}

/// Leader end of a loopback connection
pub struct LeaderPeer {
    connection: RemoteConnection,
}

impl LeaderPeer {
    /// Connect a leader and a follower over loopback TCP. Returns the
    /// leader and the follower's end of the connection.
    pub fn connect() -> (Self, RemoteConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind loopback listener");
        let leader = TcpStream::connect(listener.local_addr().expect("Listener without address"))
            .expect("Failed to connect");
        let (follower, _) = listener.accept().expect("Failed to accept");
        (
            Self {
                connection: RemoteConnection::new(leader).expect("Failed to wrap leader stream"),
            },
            RemoteConnection::new(follower).expect("Failed to wrap follower stream"),
        )
    }

    /// Leader's end of the connection
    pub fn connection(&self) -> &RemoteConnection {
        &self.connection
    }

    /// Send a typed message
    pub fn send<M: ProtocolMessage>(&self, message: M) -> Result<()> {
        self.connection.send(message)
    }

    /// Read a typed message
    pub fn read<M: ProtocolMessage>(&self) -> Result<M> {
        self.connection.read()
    }

    /// Send a snapshot header followed by the raw stream
    pub fn send_snapshot(&self, header: InstallSnapshot, stream: &[u8]) -> Result<()> {
        self.connection.send(header)?;
        let mut writer = self.connection.writer()?;
        writer.write_all(stream)?;
        writer.flush()?;
        Ok(())
    }

    /// Send an append message carrying `entries`
    pub fn send_entries(
        &self,
        term: u64,
        prev_log_index: u64,
        leader_commit: u64,
        truncate_log_before: u64,
        entries: &[LogEntry],
    ) -> Result<()> {
        self.connection.send(AppendEntries {
            term,
            prev_log_index,
            leader_commit,
            truncate_log_before,
            entries_count: entries.len() as u32,
        })?;
        for entry in entries {
            self.connection.send(entry.clone())?;
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
