use std::collections::HashSet;

use anyhow::{Result, ensure};

/// Cluster membership as seen from one node: its own address and its peers.
///
/// Membership is fixed for the lifetime of the node.
#[derive(Debug, Clone)]
pub struct Cluster {
    local: String,
    peers: Vec<String>,
}

impl Cluster {
    pub fn new(local: impl Into<String>, peers: Vec<String>) -> Result<Self> {
        let local = local.into();
        ensure!(!local.trim().is_empty(), "node address must not be empty");
        ensure!(
            !peers.contains(&local),
            "peer list must not contain this node ({local})"
        );
        let mut seen = HashSet::new();
        for peer in &peers {
            ensure!(!peer.trim().is_empty(), "peer address must not be empty");
            ensure!(seen.insert(peer.as_str()), "duplicate peer {peer}");
        }
        Ok(Self { local, peers })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Number of nodes, this one included.
    pub fn size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of all nodes.
    pub fn quorum_size(&self) -> usize {
        self.size() / 2 + 1
    }
}
