//! End-to-end follower sessions over loopback TCP
//!
//! Each test plays the leader by hand:
//! - Admission (stale terms rejected)
//! - Log-length negotiation against diverged and empty logs
//! - Snapshot installation, empty and full, with keep-alives on slow streams
//! - Steady-state append, apply and heartbeat handling
//! - Session termination on faults, timeouts and superseding leaders

use docraft_core::Error;
use docraft_core::consensus::log::LogEntry;
use docraft_core::consensus::snapshot::SnapshotWriter;
use docraft_core::consensus::protocol::{
    AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, LogLengthNegotiation,
    LogLengthNegotiationResponse, NegotiationStatus,
};
use docraft_core::consensus::{
    ClusterTopology, ConsensusConfig, ConsensusMessage, DocumentCommand, Follower, NodeRole,
    SessionState,
};
use docraft_core::testing::{LeaderPeer, TestNode, empty_snapshot, wait_for};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn topology() -> ClusterTopology {
    ClusterTopology::new("cluster-1", "A", "tcp://leader:1").with_member("B", "tcp://follower:2")
}

fn seed_log(node: &TestNode, entries: &[LogEntry]) {
    let mut txn = node.storage.write_txn().unwrap();
    node.engine.append_to_log(&mut txn, entries).unwrap();
    txn.commit().unwrap();
}

fn noops(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
    range.map(|i| LogEntry::noop(i, term)).collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("docraft_core=debug")
        .with_test_writer()
        .try_init();
}

fn accept(node: &TestNode, leader_term: u64, prev_log_index: u64, prev_log_term: u64) -> (LeaderPeer, Arc<Follower>) {
    init_tracing();
    let (leader, connection) = LeaderPeer::connect();
    let follower = Follower::new(Arc::clone(&node.engine), connection);
    leader
        .send(LogLengthNegotiation {
            term: leader_term,
            prev_log_index,
            prev_log_term,
        })
        .unwrap();
    assert!(follower.try_accept_connection().unwrap());
    (leader, follower)
}

/// Answer negotiation windows with `leader_term_at` until the follower
/// agrees on an index
fn negotiate(leader: &LeaderPeer, term: u64, leader_term_at: impl Fn(u64) -> u64) -> (LogLengthNegotiationResponse, u32) {
    let mut rounds = 0;
    loop {
        let response: LogLengthNegotiationResponse = leader.read().unwrap();
        match response.status {
            NegotiationStatus::Negotiation => {
                assert!(response.min_index <= response.midpoint_index);
                assert!(response.midpoint_index <= response.max_index);
                rounds += 1;
                leader
                    .send(LogLengthNegotiation {
                        term,
                        prev_log_index: response.midpoint_index,
                        prev_log_term: leader_term_at(response.midpoint_index),
                    })
                    .unwrap();
            }
            NegotiationStatus::Acceptable => return (response, rounds),
            NegotiationStatus::Rejected => panic!("Rejected: {}", response.message),
        }
    }
}

fn install_empty_snapshot(leader: &LeaderPeer, term: u64, index: u64, index_term: u64) -> InstallSnapshotResponse {
    leader
        .send_snapshot(
            InstallSnapshot {
                term,
                last_included_index: index,
                last_included_term: index_term,
                topology: Some(topology()),
            },
            &empty_snapshot(),
        )
        .unwrap();
    leader.read().unwrap()
}

#[test]
fn test_stale_leader_is_rejected() {
    let node = TestNode::new();
    node.engine.found_about_higher_term(5).unwrap();

    let (leader, connection) = LeaderPeer::connect();
    let follower = Follower::new(Arc::clone(&node.engine), connection);
    leader
        .send(LogLengthNegotiation {
            term: 3,
            prev_log_index: 10,
            prev_log_term: 3,
        })
        .unwrap();

    assert!(!follower.try_accept_connection().unwrap());
    let response: LogLengthNegotiationResponse = leader.read().unwrap();
    assert_eq!(response.status, NegotiationStatus::Rejected);
    assert_eq!(response.current_term, 5);
    assert_eq!(
        response.message,
        "The incoming term 3 is smaller than current term 5 and is therefore rejected"
    );

    assert_eq!(follower.state(), SessionState::Terminated);
    assert!(follower.is_disposed());
    assert_eq!(node.engine.role(), NodeRole::Passive);
    assert!(node.engine.current_follower().is_none());
}

#[test]
fn test_matching_log_is_accepted_without_search() {
    let node = TestNode::new();
    seed_log(&node, &noops(1..=10, 1));

    let (leader, follower) = accept(&node, 2, 10, 1);
    let (response, rounds) = negotiate(&leader, 2, |_| 1);
    assert_eq!(rounds, 0);
    assert_eq!(response.last_log_index, 10);
    assert_eq!(response.current_term, 2);
    assert_eq!(node.engine.role(), NodeRole::Follower);
    assert!(node.engine.is_current_follower(&follower));
}

#[test]
fn test_diverged_log_negotiates_and_catches_up() {
    let node = TestNode::new();
    seed_log(&node, &noops(1..=100, 1));

    // The leader agrees through 80 and has term 2 entries afterwards
    let (leader, follower) = accept(&node, 2, 100, 2);
    let (response, rounds) = negotiate(&leader, 2, |i| if i <= 80 { 1 } else { 2 });
    assert_eq!(response.last_log_index, 80);
    assert!(rounds <= 8, "{} rounds", rounds);
    assert_eq!(node.engine.current_term(), 2);

    let ack = install_empty_snapshot(&leader, 2, 80, 1);
    assert!(ack.done);
    assert_eq!(ack.last_log_index, 80);

    leader.send_entries(2, 80, 85, 0, &noops(81..=85, 2)).unwrap();
    let response: AppendEntriesResponse = leader.read().unwrap();
    assert!(response.success);
    assert_eq!(response.last_log_index, 85);

    let txn = node.storage.read_txn().unwrap();
    assert_eq!(node.engine.get_last_entry_index(&txn).unwrap(), 85);
    assert_eq!(node.engine.get_term_for(&txn, 81).unwrap(), Some(2));
    assert_eq!(node.engine.get_term_for(&txn, 80).unwrap(), Some(1));
    assert_eq!(node.engine.get_last_commit(&txn).unwrap(), (85, 2));
    assert_eq!(node.engine.get_topology(&txn).unwrap(), Some(topology()));
    drop(txn);

    assert_eq!(follower.state(), SessionState::SteadyState);
    assert_eq!(follower.stats().negotiation_rounds, rounds);
    assert_eq!(follower.stats().entries_received, 5);
}

#[test]
fn test_empty_follower_receives_full_snapshot() {
    let source = TestNode::new();
    let mut txn = source.storage.write_txn().unwrap();
    source
        .documents
        .put(&mut txn, "Users/1", None, &json!({ "@metadata": { "@collection": "Users" }, "name": "a" }))
        .unwrap();
    source
        .documents
        .put(&mut txn, "Users/2", None, &json!({ "@metadata": { "@collection": "Users" }, "name": "b" }))
        .unwrap();
    source.documents.put(&mut txn, "config", None, &json!({ "x": 1 })).unwrap();
    txn.commit().unwrap();
    let stream = source.snapshot();

    let node = TestNode::new();
    // Schemas travel out of band
    let mut txn = node.storage.write_txn().unwrap();
    node.documents.ensure_collection(&mut txn, "Users").unwrap();
    txn.commit().unwrap();

    let (leader, follower) = accept(&node, 3, 50, 3);
    let (response, rounds) = negotiate(&leader, 3, |_| 3);
    assert_eq!(response.last_log_index, 0);
    assert_eq!(rounds, 0);

    leader
        .send_snapshot(
            InstallSnapshot {
                term: 3,
                last_included_index: 50,
                last_included_term: 3,
                topology: Some(topology()),
            },
            &stream,
        )
        .unwrap();
    let ack: InstallSnapshotResponse = leader.read().unwrap();
    assert!(ack.done);
    assert_eq!(ack.last_log_index, 50);

    assert!(wait_for(WAIT, || follower.state() == SessionState::SteadyState));
    let txn = node.storage.read_txn().unwrap();
    assert_eq!(node.engine.get_last_commit(&txn).unwrap(), (50, 3));
    assert_eq!(node.engine.get_first_entry_index(&txn).unwrap(), 50);
    assert_eq!(node.engine.get_term_for(&txn, 50).unwrap(), Some(3));

    let user = node.documents.get(&txn, "USERS/2").unwrap().unwrap();
    assert_eq!(user.key, "Users/2");
    assert_eq!(user.collection, "Users");
    assert_eq!(user.data["name"], "b");
    assert!(node.documents.get(&txn, "config").unwrap().is_some());
    assert_eq!(node.documents.get_documents_after(&txn, 0).unwrap().len(), 3);
    drop(txn);

    // Derived state was rebuilt from the installed rows
    assert_eq!(node.documents.last_etag(), source.documents.last_etag());
    assert!(follower.stats().snapshot_items >= 6);
}

#[test]
fn test_snapshot_without_schema_terminates_session() {
    let source = TestNode::new();
    let mut txn = source.storage.write_txn().unwrap();
    source
        .documents
        .put(&mut txn, "orders/1", None, &json!({ "@metadata": { "@collection": "Orders" } }))
        .unwrap();
    txn.commit().unwrap();

    let node = TestNode::new();
    let (leader, follower) = accept(&node, 1, 0, 0);
    negotiate(&leader, 1, |_| 1);
    leader
        .send_snapshot(
            InstallSnapshot {
                term: 1,
                last_included_index: 5,
                last_included_term: 1,
                topology: Some(topology()),
            },
            &source.snapshot(),
        )
        .unwrap();

    match leader.connection().read_message().unwrap() {
        ConsensusMessage::Error { message } => assert!(message.contains("@docs/orders"), "{}", message),
        other => panic!("Expected an error report, got {:?}", other),
    }
    assert!(wait_for(WAIT, || follower.state() == SessionState::Terminated));

    // Nothing from the aborted transaction is visible
    let txn = node.storage.read_txn().unwrap();
    assert_eq!(node.engine.get_last_commit_index(&txn).unwrap(), 0);
    assert!(node.documents.get(&txn, "orders/1").unwrap().is_none());
}

#[test]
fn test_snapshot_without_topology_is_fatal() {
    let node = TestNode::new();
    let (leader, follower) = accept(&node, 1, 0, 0);
    negotiate(&leader, 1, |_| 1);

    leader
        .send_snapshot(
            InstallSnapshot {
                term: 1,
                last_included_index: 0,
                last_included_term: 0,
                topology: None,
            },
            &empty_snapshot(),
        )
        .unwrap();

    let err = leader.read::<InstallSnapshotResponse>().unwrap_err();
    assert!(matches!(err, Error::Protocol(ref message) if message.contains("topology")), "{}", err);
    assert!(wait_for(WAIT, || follower.is_disposed()));
    assert_eq!(follower.state(), SessionState::Terminated);
}

#[test]
fn test_skipped_snapshot_behind_included_index_is_fatal() {
    let node = TestNode::new();
    seed_log(&node, &noops(1..=3, 1));

    let (leader, follower) = accept(&node, 1, 3, 1);
    let (response, _) = negotiate(&leader, 1, |_| 1);
    assert_eq!(response.last_log_index, 3);

    leader
        .send_snapshot(
            InstallSnapshot {
                term: 1,
                last_included_index: 10,
                last_included_term: 1,
                topology: Some(topology()),
            },
            &empty_snapshot(),
        )
        .unwrap();

    match leader.connection().read_message().unwrap() {
        ConsensusMessage::Error { message } => assert!(message.contains("last included index 10")),
        other => panic!("Expected an error report, got {:?}", other),
    }
    assert!(wait_for(WAIT, || follower.state() == SessionState::Terminated));
}

#[test]
fn test_committed_commands_are_applied() {
    let node = TestNode::new();
    let (leader, follower) = accept(&node, 1, 0, 0);
    negotiate(&leader, 1, |_| 1);
    assert!(install_empty_snapshot(&leader, 1, 0, 0).done);

    let put = |key: &str, name: &str| DocumentCommand::Put {
        key: key.to_string(),
        expected_etag: None,
        document: json!({ "name": name }),
    };
    let entries = vec![
        LogEntry::command(1, 1, put("docs/1", "a").to_payload().unwrap()),
        LogEntry::command(2, 1, put("docs/2", "b").to_payload().unwrap()),
        LogEntry::command(
            3,
            1,
            DocumentCommand::Delete {
                key: "DOCS/1".into(),
                expected_etag: None,
            }
            .to_payload()
            .unwrap(),
        ),
        LogEntry::topology(4, 1, topology().with_member("C", "tcp://c:3").to_json().unwrap()),
    ];

    // Commit only the first two
    leader.send_entries(1, 0, 2, 0, &entries).unwrap();
    let response: AppendEntriesResponse = leader.read().unwrap();
    assert_eq!(response.last_log_index, 4);
    {
        let txn = node.storage.read_txn().unwrap();
        assert_eq!(node.engine.get_last_commit_index(&txn).unwrap(), 2);
        assert!(node.documents.get(&txn, "docs/1").unwrap().is_some());
        assert!(node.documents.get(&txn, "docs/2").unwrap().is_some());
        let installed = node.engine.get_topology(&txn).unwrap().unwrap();
        assert!(installed.contains_url("tcp://c:3"));
    }

    // Commit the rest and drop the applied prefix
    leader.send_entries(1, 4, 4, 3, &[]).unwrap();
    let response: AppendEntriesResponse = leader.read().unwrap();
    assert_eq!(response.last_log_index, 4);

    let txn = node.storage.read_txn().unwrap();
    assert_eq!(node.engine.get_last_commit(&txn).unwrap(), (4, 1));
    assert!(node.documents.get(&txn, "docs/1").unwrap().is_none());
    assert_eq!(node.engine.get_first_entry_index(&txn).unwrap(), 3);
    assert_eq!(node.engine.get_last_truncated(&txn).unwrap(), (2, 1));
    drop(txn);

    assert_eq!(follower.stats().write_transactions, 2);
    assert_eq!(follower.stats().heartbeats, 0);
}

#[test]
fn test_repeated_heartbeat_opens_no_transaction() {
    let node = TestNode::new();
    seed_log(&node, &noops(1..=5, 1));

    let (leader, follower) = accept(&node, 1, 5, 1);
    negotiate(&leader, 1, |_| 1);
    assert!(install_empty_snapshot(&leader, 1, 5, 1).done);

    leader.send_entries(1, 5, 5, 0, &[]).unwrap();
    leader.read::<AppendEntriesResponse>().unwrap();
    assert_eq!(follower.stats().write_transactions, 1);

    for _ in 0..3 {
        leader.send_entries(1, 5, 5, 0, &[]).unwrap();
        let response: AppendEntriesResponse = leader.read().unwrap();
        assert!(response.success);
        assert_eq!(response.last_log_index, 5);
    }

    let stats = follower.stats();
    assert_eq!(stats.write_transactions, 1);
    assert_eq!(stats.heartbeats, 3);
    let txn = node.storage.read_txn().unwrap();
    assert_eq!(node.engine.get_last_commit_index(&txn).unwrap(), 5);
}

#[test]
fn test_higher_term_leader_supersedes_session() {
    let node = TestNode::new();
    let (first_leader, first) = accept(&node, 1, 0, 0);
    negotiate(&first_leader, 1, |_| 1);

    let (second_leader, second) = accept(&node, 2, 0, 0);
    negotiate(&second_leader, 2, |_| 2);

    assert!(first.is_disposed());
    assert_eq!(first.state(), SessionState::Terminated);
    assert!(node.engine.is_current_follower(&second));
    assert!(!node.engine.is_current_follower(&first));
    assert_eq!(node.engine.current_term(), 2);
}

#[test]
fn test_election_timeout_ends_session() {
    let node = TestNode::with_config(
        ConsensusConfig::node("tcp://127.0.0.1:0").with_election_timeout(Duration::from_millis(200)),
    );
    let (leader, follower) = accept(&node, 1, 0, 0);
    negotiate(&leader, 1, |_| 1);

    // The leader goes quiet
    assert!(wait_for(WAIT, || node.engine.role() == NodeRole::Candidate));
    assert!(wait_for(WAIT, || follower.state() == SessionState::Terminated));
    assert!(node.engine.current_follower().is_none());
    assert!(leader.read::<InstallSnapshotResponse>().is_err());
}

#[test]
fn test_slow_snapshot_stream_sends_keep_alives() {
    let node = TestNode::with_config(
        ConsensusConfig::node("tcp://127.0.0.1:0")
            .with_election_timeout(Duration::from_millis(300))
            .with_keep_alive_batch(1),
    );
    let (leader, follower) = accept(&node, 2, 0, 0);
    let (response, _) = negotiate(&leader, 2, |_| 2);
    assert_eq!(response.last_log_index, 0);

    let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0u32..600)
        .map(|i| (i.to_be_bytes().to_vec(), vec![b'x'; 64]))
        .collect();
    let mut writer = SnapshotWriter::new(Vec::new());
    writer
        .write_tree(
            "bulk",
            pairs.len() as u64,
            pairs.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        )
        .unwrap();
    let stream = writer.finish().unwrap();

    let (progress, done) = std::thread::scope(|scope| {
        scope.spawn(|| {
            leader
                .send(InstallSnapshot {
                    term: 2,
                    last_included_index: 10,
                    last_included_term: 2,
                    topology: Some(topology()),
                })
                .unwrap();
            // Trickle the stream in well under the election timeout per gap
            for chunk in stream.chunks(stream.len() / 30 + 1) {
                let mut writer = leader.connection().writer().unwrap();
                writer.write_all(chunk).unwrap();
                writer.flush().unwrap();
                drop(writer);
                std::thread::sleep(Duration::from_millis(20));
            }
        });

        let mut progress = Vec::new();
        loop {
            let response: InstallSnapshotResponse = leader.read().unwrap();
            if response.done {
                return (progress, response);
            }
            progress.push(response);
        }
    });

    assert!(!progress.is_empty());
    assert!(progress.iter().all(|r| r.current_term == 2 && r.last_log_index == 0));
    assert_eq!(done.last_log_index, 10);

    assert!(wait_for(WAIT, || follower.state() == SessionState::SteadyState));
    assert_eq!(follower.stats().keep_alives_sent, progress.len() as u64);
    let txn = node.storage.read_txn().unwrap();
    let tree = node.storage.open_tree(&txn, "bulk").unwrap().unwrap();
    assert_eq!(tree.len(&txn).unwrap(), 600);
}
