//! Docraft Core - Replicated Document Store
//!
//! This crate provides the storage and replication core of Docraft:
//! - LMDB-backed storage environment with named trees and schema tables
//! - Case-insensitive document storage with per-document etags
//! - Follower side of a Raft-derived consensus protocol (admission,
//!   log-length negotiation, snapshot installation, steady-state append)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          Follower session (one thread)      │
//! │  admission → negotiation → snapshot → loop  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            Consensus engine                 │
//! │   (term, log, commit/apply, topology)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │     State machine (document storage)        │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            Storage environment              │
//! │        (trees, tables, global indexes)      │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod consensus;
pub mod documents;
pub mod error;
pub mod storage;
pub mod testing;

pub use error::{Error, Result};
