//! A distributed key-value store replicated across a small cluster of peer
//! nodes with a leader-based consensus protocol in the Raft family.
//!
//! Clients connect to any node and issue put/get/delete requests against a
//! replicated log; reads serve from the leader, writes require quorum
//! acknowledgement before becoming visible. Each node persists its ordered
//! log locally and materializes a key-value view through a pluggable
//! backend.
//!
//! The moving parts, leaves first: [`transport`] owns the listening
//! endpoint, the peer set and the liveness pinger; [`store`] owns the
//! ordered log, the staged slot and the commit index; [`election`] drives
//! the Follower/Candidate/Leader state machine, the timers and the
//! heartbeats; [`node`] wires them together.

pub mod config;
pub mod election;
pub mod error;
pub mod message;
pub mod node;
pub mod store;
pub mod transport;
mod util;

pub use crate::error::NodeError;
pub use crate::node::{Backend, Node, NodeConfig};
