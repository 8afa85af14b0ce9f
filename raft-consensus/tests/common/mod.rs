//! In-process cluster harness shared by the integration tests.
//!
//! Nodes talk over a [`LocalNetwork`], so partitions are simulated by
//! isolating addresses instead of killing sockets.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

use raft_consensus::log_store::{self, InmemLogStore, SharedLog};
use raft_consensus::message::{LogEntry, Term};
use raft_consensus::transport::LocalNetwork;
use raft_consensus::{Cluster, Config, NodeConfig, NodeHandle, NodeStatus, Role, spawn_node};

pub const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

pub fn test_config() -> Config {
    Config {
        election_timeout: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(30),
        rpc_timeout: Duration::from_millis(100),
        ..Config::default()
    }
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    handles: Vec<NodeHandle>,
    logs: Vec<SharedLog>,
    applied: Vec<mpsc::UnboundedReceiver<LogEntry>>,
}

impl TestCluster {
    /// Spawns `n` nodes named `node-1` .. `node-n`.
    pub async fn spawn(n: usize) -> Result<Self> {
        let network = LocalNetwork::new(test_config().rpc_timeout);
        let addrs: Vec<String> = (1..=n).map(|id| format!("node-{id}")).collect();

        let mut handles = Vec::new();
        let mut logs = Vec::new();
        let mut applied = Vec::new();
        for addr in &addrs {
            let peers = addrs.iter().filter(|peer| *peer != addr).cloned().collect();
            let log = log_store::shared(InmemLogStore::new());
            let (applied_tx, applied_rx) = mpsc::unbounded_channel();

            let handle = spawn_node(
                NodeConfig {
                    cluster: Cluster::new(addr.clone(), peers)?,
                    config: test_config(),
                },
                network.transport(addr.clone()),
                Arc::clone(&log),
                applied_tx,
            )?;
            network.register(addr.clone(), handle.rpc_sender()).await;

            handles.push(handle);
            logs.push(log);
            applied.push(applied_rx);
        }

        Ok(Self {
            network,
            handles,
            logs,
            applied,
        })
    }

    /// Node by 1-indexed id.
    pub fn node(&self, id: usize) -> &NodeHandle {
        &self.handles[id - 1]
    }

    pub fn addr(&self, id: usize) -> String {
        format!("node-{id}")
    }

    pub fn ids(&self) -> Vec<usize> {
        (1..=self.handles.len()).collect()
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.handles.iter().map(NodeHandle::status).collect()
    }

    /// Waits until exactly one of `among` is leader and returns its id.
    pub async fn wait_for_single_leader(&self, among: &[usize]) -> Result<usize> {
        let deadline = Instant::now() + WAIT;
        loop {
            let leaders: Vec<usize> = among
                .iter()
                .copied()
                .filter(|&id| self.node(id).status().role == Role::Leader)
                .collect();
            if let [leader] = leaders[..] {
                return Ok(leader);
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for a single leader among {among:?}, saw {leaders:?}");
            }
            sleep(POLL).await;
        }
    }

    /// Polls until `check` holds for node `id`.
    pub async fn wait_for_node(
        &self,
        id: usize,
        what: &str,
        check: impl Fn(&NodeStatus) -> bool,
    ) -> Result<NodeStatus> {
        let deadline = Instant::now() + WAIT;
        loop {
            let status = self.node(id).status();
            if check(&status) {
                return Ok(status);
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for node {id}: {what}; last status {status:?}");
            }
            sleep(POLL).await;
        }
    }

    /// Receives the next entry node `id` applied.
    pub async fn next_applied(&mut self, id: usize) -> Result<LogEntry> {
        match tokio::time::timeout(WAIT, self.applied[id - 1].recv()).await {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => bail!("node {id} stopped applying"),
            Err(_) => bail!("timeout waiting for node {id} to apply an entry"),
        }
    }

    /// Whether node `id` applied anything not yet received.
    pub fn has_unread_applied(&mut self, id: usize) -> bool {
        !self.applied[id - 1].is_empty()
    }

    /// `(term, command)` of every entry in node `id`'s log.
    pub async fn log(&self, id: usize) -> Vec<(Term, Vec<u8>)> {
        let log = self.logs[id - 1].read().await;
        (log.first_index().max(1)..=log.last_index())
            .filter_map(|index| log.get_log(index).ok())
            .map(|entry| (entry.term, entry.command))
            .collect()
    }

    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.shutdown().await;
        }
    }
}
