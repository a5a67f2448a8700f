//! Consensus engine
//!
//! Owns the persistent consensus state of this node and the single active
//! follower session. All log and marker mutations take the caller's write
//! transaction so they commit atomically with whatever else the caller
//! does (appending, applying, installing a snapshot).
//!
//! ```text
//! $log       index -> StoredEntry
//! $state     CurrentTerm, LastCommitIndex/Term, LastTruncatedIndex/Term
//! $topology  "Topology" -> ClusterTopology
//! ```

use super::config::ConsensusConfig;
use super::follower::Follower;
use super::log::{EntryKind, LogEntry, StoredEntry};
use super::state_machine::StateMachine;
use super::timeout::TimeoutEvent;
use super::topology::ClusterTopology;
use super::{Index, Term};
use crate::storage::StorageEnvironment;
use crate::{Error, Result};
use heed::byteorder::BigEndian;
use heed::types::{SerdeBincode, Str, U64};
use heed::{Database, RoTxn, RwTxn};
use parking_lot::Mutex;
use std::ops::RangeFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const CURRENT_TERM: &str = "CurrentTerm";
const LAST_COMMIT_INDEX: &str = "LastCommitIndex";
const LAST_COMMIT_TERM: &str = "LastCommitTerm";
const LAST_TRUNCATED_INDEX: &str = "LastTruncatedIndex";
const LAST_TRUNCATED_TERM: &str = "LastTruncatedTerm";
const TOPOLOGY: &str = "Topology";

/// Role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Not part of a cluster yet
    Passive,
    /// Election timeout expired
    Candidate,
    /// Following a leader
    Follower,
    /// Leading
    Leader,
}

struct RoleState {
    role: NodeRole,
    follower: Option<Arc<Follower>>,
}

/// Consensus engine
pub struct ConsensusEngine {
    config: ConsensusConfig,
    storage: Arc<StorageEnvironment>,
    state_machine: Arc<dyn StateMachine>,
    log: Database<U64<BigEndian>, SerdeBincode<StoredEntry>>,
    state: Database<Str, U64<BigEndian>>,
    topology: Database<Str, SerdeBincode<ClusterTopology>>,
    current_term: AtomicU64,
    role: Mutex<RoleState>,
    timeout: TimeoutEvent,
    this: Weak<ConsensusEngine>,
}

impl ConsensusEngine {
    /// Open the engine over `storage`
    pub fn open(
        config: ConsensusConfig,
        storage: Arc<StorageEnvironment>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(Error::invalid_argument)?;

        let mut txn = storage.write_txn()?;
        let log = storage.create_internal_database(&mut txn, "$log")?;
        let state: Database<Str, U64<BigEndian>> =
            storage.create_internal_database(&mut txn, "$state")?;
        let topology = storage.create_internal_database(&mut txn, "$topology")?;
        let current_term = state.get(&txn, CURRENT_TERM)?.unwrap_or(0);
        txn.commit()?;

        tracing::info!(
            "Consensus engine for {} opened in term {}",
            config.url,
            current_term
        );

        let timeout = TimeoutEvent::new(config.election_timeout);
        Ok(Arc::new_cyclic(|this| Self {
            config,
            storage,
            state_machine,
            log,
            state,
            topology,
            current_term: AtomicU64::new(current_term),
            role: Mutex::new(RoleState {
                role: NodeRole::Passive,
                follower: None,
            }),
            timeout,
            this: this.clone(),
        }))
    }

    /// Configuration
    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// This node's url
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Storage environment
    pub fn storage(&self) -> &Arc<StorageEnvironment> {
        &self.storage
    }

    /// Current term
    pub fn current_term(&self) -> Term {
        self.current_term.load(Ordering::SeqCst)
    }

    /// Election timeout
    pub fn election_timeout(&self) -> Duration {
        self.config.election_timeout
    }

    /// Election timer
    pub fn timeout(&self) -> &TimeoutEvent {
        &self.timeout
    }

    /// Current role
    pub fn role(&self) -> NodeRole {
        self.role.lock().role
    }

    /// Active follower session, if any
    pub fn current_follower(&self) -> Option<Arc<Follower>> {
        self.role.lock().follower.clone()
    }

    /// Whether `follower` is the active session
    pub fn is_current_follower(&self, follower: &Follower) -> bool {
        let state = self.role.lock();
        state.role == NodeRole::Follower
            && state
                .follower
                .as_ref()
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), follower))
    }

    /// Term of the entry at `index`, if we know it
    ///
    /// Index 0 has term 0. Entries removed by truncation are still known
    /// through the truncation and commit markers.
    pub fn get_term_for(&self, txn: &RoTxn, index: Index) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if let Some(entry) = self.log.get(txn, &index)? {
            return Ok(Some(entry.term));
        }
        let (truncated_index, truncated_term) = self.get_last_truncated(txn)?;
        if truncated_index == index {
            return Ok(Some(truncated_term));
        }
        let (commit_index, commit_term) = self.get_last_commit(txn)?;
        if commit_index == index {
            return Ok(Some(commit_term));
        }
        Ok(None)
    }

    /// Term of an entry that must exist
    pub fn get_term_for_known_existing(&self, txn: &RoTxn, index: Index) -> Result<Term> {
        self.get_term_for(txn, index)?
            .ok_or_else(|| Error::consensus(format!("Expected an entry at index {}", index)))
    }

    /// First index we can answer for: the first log entry, or the newest
    /// marker when the log is empty. 0 means nothing at all.
    pub fn get_first_entry_index(&self, txn: &RoTxn) -> Result<Index> {
        if let Some((index, _)) = self.log.first(txn)? {
            return Ok(index);
        }
        self.marker_index(txn)
    }

    /// Last index we can answer for
    pub fn get_last_entry_index(&self, txn: &RoTxn) -> Result<Index> {
        if let Some((index, _)) = self.log.last(txn)? {
            return Ok(index);
        }
        self.marker_index(txn)
    }

    fn marker_index(&self, txn: &RoTxn) -> Result<Index> {
        let (truncated, _) = self.get_last_truncated(txn)?;
        let (commit, _) = self.get_last_commit(txn)?;
        Ok(truncated.max(commit))
    }

    /// Entry at `index`
    pub fn get_entry(&self, txn: &RoTxn, index: Index) -> Result<Option<LogEntry>> {
        Ok(self.log.get(txn, &index)?.map(|entry| entry.into_entry(index)))
    }

    /// Number of entries in the log
    pub fn log_len(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.log.len(txn)?)
    }

    /// Highest applied index
    pub fn get_last_commit_index(&self, txn: &RoTxn) -> Result<Index> {
        Ok(self.get_last_commit(txn)?.0)
    }

    /// Highest applied `(index, term)`
    pub fn get_last_commit(&self, txn: &RoTxn) -> Result<(Index, Term)> {
        Ok((
            self.state.get(txn, LAST_COMMIT_INDEX)?.unwrap_or(0),
            self.state.get(txn, LAST_COMMIT_TERM)?.unwrap_or(0),
        ))
    }

    /// Newest `(index, term)` removed by prefix truncation
    pub fn get_last_truncated(&self, txn: &RoTxn) -> Result<(Index, Term)> {
        Ok((
            self.state.get(txn, LAST_TRUNCATED_INDEX)?.unwrap_or(0),
            self.state.get(txn, LAST_TRUNCATED_TERM)?.unwrap_or(0),
        ))
    }

    /// Record the applied position
    pub fn set_last_commit_index(&self, txn: &mut RwTxn, index: Index, term: Term) -> Result<()> {
        self.state.put(txn, LAST_COMMIT_INDEX, &index)?;
        self.state.put(txn, LAST_COMMIT_TERM, &term)?;
        Ok(())
    }

    /// Drop log entries below `upto`. Never removes an entry at or after
    /// the applied index.
    pub fn truncate_log_before(&self, txn: &mut RwTxn, upto: Index) -> Result<()> {
        let applied = self.get_last_commit_index(txn)?;
        let upto = upto.min(applied);
        if upto == 0 {
            return Ok(());
        }

        let newest_removed = match self.log.rev_range(txn, &(..upto))?.next() {
            Some(item) => {
                let (index, entry) = item?;
                Some((index, entry.term))
            }
            None => None,
        };
        let Some((index, term)) = newest_removed else {
            return Ok(());
        };

        let removed = self.log.delete_range(txn, &(..upto))?;
        self.state.put(txn, LAST_TRUNCATED_INDEX, &index)?;
        self.state.put(txn, LAST_TRUNCATED_TERM, &term)?;
        tracing::debug!("Truncated {} log entries up to index {}", removed, index);
        Ok(())
    }

    /// Drop `from` and every later entry. Committed entries are never
    /// removed.
    pub fn remove_entries_from(&self, txn: &mut RwTxn, from: Index) -> Result<()> {
        let applied = self.get_last_commit_index(txn)?;
        if from <= applied {
            return Err(Error::consensus(format!(
                "Refusing to remove entries from {}: index {} is already committed",
                from, applied
            )));
        }
        let range: RangeFrom<Index> = from..;
        let removed = self.log.delete_range(txn, &range)?;
        tracing::info!("Removed {} conflicting log entries from index {}", removed, from);
        Ok(())
    }

    /// Append entries, resolving conflicts with the local suffix. Returns
    /// the newest topology among them, which is also installed.
    pub fn append_to_log(&self, txn: &mut RwTxn, entries: &[LogEntry]) -> Result<Option<ClusterTopology>> {
        let applied = self.get_last_commit_index(txn)?;
        let mut latest_topology = None;

        for entry in entries {
            if entry.index == 0 {
                return Err(Error::protocol("Log entries start at index 1"));
            }
            if entry.index <= applied {
                continue;
            }

            match self.log.get(txn, &entry.index)? {
                Some(existing) if existing.term == entry.term => continue,
                Some(existing) => {
                    tracing::info!(
                        "Entry {} has term {} locally but {} at the leader",
                        entry.index,
                        existing.term,
                        entry.term
                    );
                    self.remove_entries_from(txn, entry.index)?;
                }
                None => {}
            }

            let last = self.get_last_entry_index(txn)?;
            if entry.index != last + 1 {
                return Err(Error::protocol(format!(
                    "Gap in appended entries: last local index is {}, got {}",
                    last, entry.index
                )));
            }

            self.log.put(txn, &entry.index, &StoredEntry::from(entry))?;
            if entry.kind == EntryKind::Topology {
                latest_topology = Some(ClusterTopology::from_json(&entry.payload)?);
            }
        }

        if let Some(topology) = &latest_topology {
            self.set_topology(txn, topology)?;
        }
        Ok(latest_topology)
    }

    /// Apply committed entries up to `upto` and advance the commit marker
    pub fn apply(&self, txn: &mut RwTxn, upto: Index) -> Result<()> {
        let applied = self.get_last_commit_index(txn)?;
        if upto <= applied {
            return Ok(());
        }

        let mut term = 0;
        for index in applied + 1..=upto {
            let entry = self
                .log
                .get(txn, &index)?
                .ok_or_else(|| Error::consensus(format!("Missing log entry {} to apply", index)))?;
            if entry.kind == EntryKind::Command {
                self.state_machine.apply(txn, index, &entry.payload)?;
            }
            term = entry.term;
        }

        self.set_last_commit_index(txn, upto, term)?;
        tracing::debug!("Applied entries {}..={}", applied + 1, upto);
        Ok(())
    }

    /// Install a topology
    pub fn set_topology(&self, txn: &mut RwTxn, topology: &ClusterTopology) -> Result<()> {
        self.topology.put(txn, TOPOLOGY, topology)?;
        tracing::info!(
            "Installed topology {} with {} members",
            topology.topology_id,
            topology.members.len()
        );
        Ok(())
    }

    /// Installed topology
    pub fn get_topology(&self, txn: &RoTxn) -> Result<Option<ClusterTopology>> {
        Ok(self.topology.get(txn, TOPOLOGY)?)
    }

    /// A snapshot was committed; let the state machine catch up
    pub fn snapshot_installed(&self, txn: &RoTxn) -> Result<()> {
        self.state_machine.on_snapshot_installed(txn)
    }

    /// Adopt a higher term seen from a peer, stepping down if we were
    /// campaigning or leading
    pub fn found_about_higher_term(&self, term: Term) -> Result<()> {
        if term <= self.current_term() {
            return Ok(());
        }

        let mut txn = self.storage.write_txn()?;
        self.state.put(&mut txn, CURRENT_TERM, &term)?;
        txn.commit()?;

        let previous = self.current_term.swap(term, Ordering::SeqCst);
        tracing::info!("Found about higher term {} (was {})", term, previous);

        let mut state = self.role.lock();
        if matches!(state.role, NodeRole::Candidate | NodeRole::Leader) {
            tracing::info!("Stepping down from {:?} in term {}", state.role, term);
            state.role = if state.follower.is_some() {
                NodeRole::Follower
            } else {
                NodeRole::Passive
            };
        }
        Ok(())
    }

    /// Switch role, making `follower` the active session. The previous
    /// session, if different, is disposed.
    pub fn set_new_state(&self, role: NodeRole, follower: Option<Arc<Follower>>) {
        let previous = {
            let mut state = self.role.lock();
            if state.role != role {
                tracing::info!("{}: {:?} -> {:?}", self.config.url, state.role, role);
            }
            state.role = role;
            std::mem::replace(&mut state.follower, follower.clone())
        };

        if let Some(previous) = previous {
            let replaced = follower
                .as_ref()
                .is_none_or(|current| !Arc::ptr_eq(current, &previous));
            if replaced {
                previous.dispose();
            }
        }
    }

    /// Give up on the current leader
    pub fn switch_to_candidate_state(&self, reason: &str) {
        tracing::info!(
            "{} switching to candidate in term {}: {}",
            self.config.url,
            self.current_term(),
            reason
        );
        self.set_new_state(NodeRole::Candidate, None);
    }

    /// Arm the election timer; expiry switches this node to candidate
    pub fn start_election_timer(&self) -> Result<()> {
        let engine = self.this.clone();
        self.timeout.start(move || {
            if let Some(engine) = engine.upgrade() {
                engine.switch_to_candidate_state("election timeout");
            }
        })
    }

    /// Stop the timer and end the active session
    pub fn shutdown(&self) {
        self.timeout.stop();
        self.set_new_state(NodeRole::Passive, None);
        tracing::info!("Consensus engine for {} shut down", self.config.url);
    }
}
