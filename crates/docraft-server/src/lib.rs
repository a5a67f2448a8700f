//! Docraft Server - replica node
//!
//! Opens the node's storage and consensus engine and accepts leader
//! connections, running one follower session per accepted leader.

pub mod config;
pub mod listener;

pub use config::Config;
pub use listener::{Node, serve};
