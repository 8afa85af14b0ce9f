//! Raft consensus core with a replicated key-value store on top.
//!
//! A cluster of nodes elects a single leader per term and replicates an
//! append-only log of opaque commands. An entry stored on a majority is
//! committed and handed to every node's [`store::StateMachine`] exactly once,
//! in index order.
//!
//! # Architecture
//!
//! Each node is a set of tokio tasks that share nothing but the log:
//!
//! - **Node task** ([`node`]): owns term, vote, role and commit state; handles
//!   inbound RPCs, client proposals and timers one message at a time
//! - **Replication tasks**: one per peer while leading, each
//!   owning that peer's progress and reporting back over a channel
//! - **Vote tasks**: short-lived, one per peer per election
//!
//! Nodes reach each other through a [`transport::Transport`]: JSON over HTTP
//! in production ([`http`] serves the receiving side), or an in-process
//! [`transport::LocalNetwork`] that tests can partition.
//!
//! # Modules
//!
//! - [`log_store`]: the log storage contract and the in-memory store
//! - [`message`]: RPC payloads and the envelopes delivering them to a node
//! - [`node`]: the role state machine and RPC rules
//! - [`runtime`]: spawning a node and the [`runtime::NodeHandle`] API
//! - [`store`] / [`command`]: the key-value state machine and its commands

pub mod command;
pub mod config;
pub mod error;
pub mod http;
pub mod log_store;
pub mod message;
pub mod node;
mod replication;
pub mod runtime;
pub mod store;
pub mod timer;
pub mod topology;
pub mod transport;

pub use config::Config;
pub use error::RaftError;
pub use node::{NodeStatus, Role};
pub use runtime::{NodeConfig, NodeHandle, spawn_node};
pub use topology::Cluster;
