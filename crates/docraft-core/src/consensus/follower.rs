//! Follower session
//!
//! One session per accepted leader connection:
//! - Admission check on the accepting thread (stale terms are rejected)
//! - Log-length negotiation, snapshot installation and the append-entries
//!   loop on a dedicated worker thread
//! - Disposal shuts the connection down and joins the worker, unless it is
//!   the worker disposing itself

use super::engine::{ConsensusEngine, NodeRole};
use super::negotiation::{self, NegotiationWindow};
use super::protocol::{
    AppendEntries, AppendEntriesResponse, ConsensusMessage, InstallSnapshot,
    InstallSnapshotResponse, LogLengthNegotiation, LogLengthNegotiationResponse,
    NegotiationStatus, ProtocolMessage,
};
use super::connection::RemoteConnection;
use super::log::LogEntry;
use super::snapshot::{self, KeepAlive, SnapshotInstall, SnapshotReader};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use uuid::Uuid;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the leader's first negotiation message
    CheckingLeader,
    /// Searching for the agreed log position
    Negotiating,
    /// Receiving the snapshot stream
    InstallingSnapshot,
    /// Processing append-entries messages
    SteadyState,
    /// Finished
    Terminated,
}

/// Follower session statistics
#[derive(Debug, Clone, Default)]
pub struct FollowerStats {
    /// Log entries received
    pub entries_received: u64,
    /// Append messages that needed no transaction
    pub heartbeats: u64,
    /// Append messages that committed a transaction
    pub write_transactions: u64,
    /// Negotiation round trips
    pub negotiation_rounds: u32,
    /// Index agreed on with the leader
    pub negotiated_index: u64,
    /// Snapshot items processed
    pub snapshot_items: u64,
    /// Keep-alives sent during snapshot installation
    pub keep_alives_sent: u64,
}

/// Follower side of a leader connection
pub struct Follower {
    id: String,
    engine: Arc<ConsensusEngine>,
    connection: RemoteConnection,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<SessionState>,
    stats: Mutex<FollowerStats>,
    disposed: AtomicBool,
}

impl Follower {
    /// Create a session for an accepted connection
    pub fn new(engine: Arc<ConsensusEngine>, connection: RemoteConnection) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            engine,
            connection,
            worker: Mutex::new(None),
            state: Mutex::new(SessionState::CheckingLeader),
            stats: Mutex::new(FollowerStats::default()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Leader address
    pub fn source(&self) -> &str {
        self.connection.source()
    }

    /// Lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> FollowerStats {
        self.stats.lock().clone()
    }

    /// Run the admission check and, if the leader is acceptable, become the
    /// engine's follower and start the session worker. Returns false when
    /// the leader was rejected.
    pub fn try_accept_connection(self: &Arc<Self>) -> Result<bool> {
        let negotiation = match self.check_if_valid_leader() {
            Ok(Some(negotiation)) => negotiation,
            Ok(None) => {
                self.set_state(SessionState::Terminated);
                self.dispose();
                return Ok(false);
            }
            Err(e) => {
                self.set_state(SessionState::Terminated);
                self.dispose();
                return Err(e);
            }
        };

        // Leader or candidate: this takes us out of play
        self.engine
            .set_new_state(NodeRole::Follower, Some(Arc::clone(self)));
        self.engine.start_election_timer()?;
        self.set_state(SessionState::Negotiating);

        let session = Arc::clone(self);
        let mut worker = self.worker.lock();
        let handle = thread::Builder::new()
            .name(format!("follower-{}", &self.id[..8]))
            .spawn(move || session.run(negotiation))?;
        *worker = Some(handle);

        tracing::info!(
            "Accepted leader {} in term {} (session {})",
            self.source(),
            self.engine.current_term(),
            self.id
        );
        Ok(true)
    }

    fn check_if_valid_leader(&self) -> Result<Option<LogLengthNegotiation>> {
        // A peer that connects and stays silent must not pin this session
        self.connection
            .set_read_timeout(Some(self.engine.config().admission_timeout))?;
        let negotiation: LogLengthNegotiation = self.connection.read()?;
        self.connection.set_read_timeout(None)?;
        let current_term = self.engine.current_term();

        if negotiation.term < current_term {
            let message = format!(
                "The incoming term {} is smaller than current term {} and is therefore rejected",
                negotiation.term, current_term
            );
            tracing::info!("Rejecting leader {}: {}", self.source(), message);
            self.connection
                .send(LogLengthNegotiationResponse::rejected(current_term, message))?;
            return Ok(None);
        }

        self.engine.timeout().defer();
        Ok(Some(negotiation))
    }

    fn run(self: Arc<Self>, negotiation: LogLengthNegotiation) {
        match self.run_session(negotiation) {
            Ok(()) => {}
            Err(e) if e.is_benign_termination() => {
                tracing::debug!("Follower session {} with {} ended: {}", self.id, self.source(), e);
            }
            Err(e) => {
                let report = ConsensusMessage::Error {
                    message: e.to_string(),
                };
                if let Err(send_error) = self.connection.send_message(&report) {
                    tracing::debug!("Could not report failure to leader: {}", send_error);
                }
                tracing::info!(
                    "{}: failed to talk to leader {}: {}",
                    self.engine.url(),
                    self.source(),
                    e
                );
            }
        }

        self.set_state(SessionState::Terminated);
        self.dispose();
    }

    fn run_session(&self, negotiation: LogLengthNegotiation) -> Result<()> {
        self.negotiate_with_leader(negotiation)?;

        self.set_state(SessionState::InstallingSnapshot);
        self.receive_snapshot()?;

        self.set_state(SessionState::SteadyState);
        self.steady_state()
    }

    fn negotiate_with_leader(&self, negotiation: LogLengthNegotiation) -> Result<()> {
        // Only the leader sends negotiations, so an accepted one is the leader
        if negotiation.term > self.engine.current_term() {
            self.engine.found_about_higher_term(negotiation.term)?;
        }

        let storage = Arc::clone(self.engine.storage());
        let txn = storage.read_txn()?;
        let local_term = self
            .engine
            .get_term_for(&txn, negotiation.prev_log_index)?
            .unwrap_or(0);

        let (agreed, message) = if local_term == negotiation.prev_log_term {
            (
                negotiation.prev_log_index,
                format!(
                    "Found a log index / term match at {} with term {}",
                    negotiation.prev_log_index, local_term
                ),
            )
        } else {
            let first = self.engine.get_first_entry_index(&txn)?;
            let last = self.engine.get_last_entry_index(&txn)?;
            let outcome = negotiation::negotiate(
                first,
                last,
                negotiation.prev_log_index,
                |index| self.engine.get_term_for(&txn, index),
                |window| self.exchange_window(window),
            )?;
            self.stats.lock().negotiation_rounds = outcome.rounds;

            let message = if first == 0 {
                "No entries at all here, give me everything from the start".to_string()
            } else {
                format!(
                    "Found a log index / term match at {} after {} rounds",
                    outcome.last_log_index, outcome.rounds
                )
            };
            (outcome.last_log_index, message)
        };
        drop(txn);

        tracing::info!("Negotiated log position {} with {}", agreed, self.source());
        self.stats.lock().negotiated_index = agreed;
        self.connection.send(LogLengthNegotiationResponse::acceptable(
            self.engine.current_term(),
            agreed,
            message,
        ))?;
        self.engine.timeout().defer();
        Ok(())
    }

    fn exchange_window(&self, window: &NegotiationWindow) -> Result<LogLengthNegotiation> {
        self.engine.timeout().defer();
        self.connection.send(LogLengthNegotiationResponse {
            status: NegotiationStatus::Negotiation,
            message: format!(
                "Term/Index mismatch from leader, need to figure out at what point the logs match, range: {} - {} | {} in term {}",
                window.min_index, window.max_index, window.midpoint_index, window.midpoint_term
            ),
            current_term: self.engine.current_term(),
            last_log_index: 0,
            min_index: window.min_index,
            max_index: window.max_index,
            midpoint_index: window.midpoint_index,
            midpoint_term: window.midpoint_term,
        })?;
        let proposal = self.connection.read()?;
        self.engine.timeout().defer();
        Ok(proposal)
    }

    fn receive_snapshot(&self) -> Result<()> {
        // The leader always sends one, usually empty
        let header: InstallSnapshot = self.read()?;
        let storage = Arc::clone(self.engine.storage());

        let mut txn = storage.write_txn()?;
        let last_log_index = self.engine.get_last_entry_index(&txn)?;
        let mut keep_alive = KeepAlive::new(
            self.engine.config().keep_alive_batch,
            self.engine.election_timeout() / 2,
        );
        let outcome = {
            let mut reader = self.connection.reader()?;
            let mut reader = SnapshotReader::new(&mut *reader);
            snapshot::install_snapshot(&storage, &mut txn, &mut reader, &mut keep_alive, &mut || {
                self.engine.timeout().defer();
                self.connection.send(InstallSnapshotResponse {
                    done: false,
                    current_term: self.engine.current_term(),
                    last_log_index,
                })
            })?
        };

        match outcome {
            SnapshotInstall::Installed { trees, tables, items } => {
                let included = header.last_included_index;
                let (applied, _) = self.engine.get_last_commit(&txn)?;
                if included > applied {
                    if let Some(local) = self.engine.get_entry(&txn, included)? {
                        if local.term != header.last_included_term {
                            self.engine.remove_entries_from(&mut txn, included)?;
                        }
                    }
                }
                self.engine
                    .set_last_commit_index(&mut txn, included, header.last_included_term)?;
                self.engine.truncate_log_before(&mut txn, included)?;
                tracing::info!(
                    "Installed snapshot up to {} (term {}): {} trees, {} tables, {} items",
                    included,
                    header.last_included_term,
                    trees,
                    tables,
                    items
                );
            }
            SnapshotInstall::NoOp => {
                let last = self.engine.get_last_entry_index(&txn)?;
                if last < header.last_included_index {
                    return Err(Error::snapshot_integrity(format!(
                        "The snapshot installation had failed because the last included index {} in term {} doesn't match the last entry {}",
                        header.last_included_index, header.last_included_term, last
                    )));
                }
            }
        }

        // Every snapshot carries the latest topology
        let topology = header
            .topology
            .as_ref()
            .ok_or_else(|| Error::snapshot_integrity("Expected to get topology on snapshot"))?;
        self.engine.set_topology(&mut txn, topology)?;
        txn.commit()?;

        {
            let mut stats = self.stats.lock();
            stats.snapshot_items = keep_alive.processed();
            stats.keep_alives_sent = keep_alive.sent();
        }

        self.connection.send(InstallSnapshotResponse {
            done: true,
            current_term: self.engine.current_term(),
            last_log_index: header.last_included_index,
        })?;

        let txn = storage.read_txn()?;
        self.engine.snapshot_installed(&txn)?;
        drop(txn);

        self.engine.timeout().defer();
        Ok(())
    }

    fn steady_state(&self) -> Result<()> {
        let storage = Arc::clone(self.engine.storage());
        let mut entries = Vec::new();
        let (mut last_commit, mut last_truncate) = (0, 0);

        loop {
            entries.clear();
            let append: AppendEntries = self.read()?;
            if !self.engine.is_current_follower(self) {
                return Err(Error::Cancelled);
            }
            if append.term > self.engine.current_term() {
                self.engine.found_about_higher_term(append.term)?;
            }

            for _ in 0..append.entries_count {
                let entry: LogEntry = self.read()?;
                entries.push(entry);
            }

            let mut last_log_index = append.prev_log_index;

            // Heartbeats don't need a write transaction
            if !entries.is_empty()
                || append.leader_commit != last_commit
                || append.truncate_log_before != last_truncate
            {
                let mut txn = storage.write_txn()?;
                if !entries.is_empty() {
                    self.engine.append_to_log(&mut txn, &entries)?;
                }

                last_log_index = self.engine.get_last_entry_index(&txn)?;
                let commit_target = last_log_index.min(append.leader_commit);
                if commit_target > self.engine.get_last_commit_index(&txn)? {
                    self.engine.apply(&mut txn, commit_target)?;
                }
                self.engine.truncate_log_before(
                    &mut txn,
                    append.truncate_log_before.min(commit_target),
                )?;
                txn.commit()?;

                last_commit = append.leader_commit;
                last_truncate = append.truncate_log_before;

                let mut stats = self.stats.lock();
                stats.write_transactions += 1;
                stats.entries_received += entries.len() as u64;
            } else {
                self.stats.lock().heartbeats += 1;
            }

            self.connection.send(AppendEntriesResponse {
                current_term: self.engine.current_term(),
                last_log_index,
                success: true,
            })?;
            self.engine.timeout().defer();
        }
    }

    /// Read a message, deferring the election timeout once it arrives
    fn read<M: ProtocolMessage>(&self) -> Result<M> {
        let message = self.connection.read()?;
        self.engine.timeout().defer();
        Ok(message)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("Follower session {}: {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    /// Close the connection and wait for the worker to finish. From the
    /// worker itself this only closes the connection.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.connection.dispose();
            tracing::debug!("Disposed follower session {}", self.id);
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                *self.worker.lock() = Some(handle);
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Follower session {} worker panicked", self.id);
            }
        }
    }

    /// Whether the session was disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
