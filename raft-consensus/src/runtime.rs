//! Spawning nodes and talking to them.
//!
//! [`spawn_node`] moves a node's state onto its own tokio task and returns a
//! [`NodeHandle`]. Everything else in the process (HTTP handlers, tests, the
//! binary) talks to the node through that handle, never through shared state.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, info_span, warn};

use crate::config::Config;
use crate::error::RaftError;
use crate::log_store::SharedLog;
use crate::message::{LogIndex, RpcSender};
use crate::node::{Core, Inbox, NodeStatus, Proposal};
use crate::store::StateMachine;
use crate::topology::Cluster;
use crate::transport::Transport;

/// Identity and tuning of a node to spawn.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub cluster: Cluster,
    pub config: Config,
}

/// Cloneable handle to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    addr: String,
    rpc: RpcSender,
    proposal_tx: mpsc::Sender<Proposal>,
    status_rx: watch::Receiver<NodeStatus>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl NodeHandle {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Submits a command for replication.
    ///
    /// Resolves with the entry's index once it is committed and applied on
    /// this node. Fails fast with [`RaftError::NotLeader`] on any other role.
    pub async fn propose(&self, command: Vec<u8>) -> Result<LogIndex, RaftError> {
        let (respond_to, rx) = oneshot::channel();
        self.proposal_tx
            .send(Proposal {
                command,
                respond_to,
            })
            .await
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    pub fn status(&self) -> NodeStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that sees every published status change.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status_rx.clone()
    }

    /// Entry point for RPCs arriving from peers.
    pub fn rpc_sender(&self) -> RpcSender {
        self.rpc.clone()
    }

    /// Stops the node and waits for its task to finish.
    ///
    /// A leader stops its replication loops and fails pending proposals with
    /// [`RaftError::LeadershipLost`] before the task exits. Calling this more
    /// than once is harmless.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(node = %self.addr, error = %err, "node task ended abnormally");
            }
        }
    }
}

/// Starts a node on the current tokio runtime.
///
/// The node begins as a follower in term 0 with whatever `log` already holds.
/// Committed entries are handed to `state_machine` in index order.
pub fn spawn_node<T: Transport>(
    node: NodeConfig,
    transport: T,
    log: SharedLog,
    state_machine: impl StateMachine,
) -> Result<NodeHandle> {
    let NodeConfig { cluster, config } = node;
    config.validate()?;

    let (rpc_tx, rpc_rx) = mpsc::channel(config.channel_capacity);
    let (proposal_tx, proposal_rx) = mpsc::channel(config.channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = cluster.local().to_string();
    let (status_tx, status_rx) = watch::channel(NodeStatus::initial(&addr));

    let core = Core::new(
        cluster,
        config,
        Arc::new(transport),
        log,
        Box::new(state_machine),
        Inbox {
            rpc_rx,
            proposal_rx,
            shutdown_rx,
        },
        status_tx,
    );
    let span = info_span!("raft", node = %addr);
    let task = tokio::spawn(core.run().instrument(span));

    Ok(NodeHandle {
        addr,
        rpc: RpcSender::new(rpc_tx),
        proposal_tx,
        status_rx,
        shutdown_tx: Arc::new(shutdown_tx),
        task: Arc::new(Mutex::new(Some(task))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::{self, InmemLogStore};
    use crate::message::LogEntry;
    use crate::node::Role;
    use crate::transport::LocalNetwork;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_config() -> Config {
        Config {
            election_timeout: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(10),
            ..Config::default()
        }
    }

    fn single_node() -> (NodeHandle, mpsc::UnboundedReceiver<LogEntry>) {
        let network = LocalNetwork::new(Duration::from_millis(50));
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let node = spawn_node(
            NodeConfig {
                cluster: Cluster::new("solo", vec![]).unwrap(),
                config: fast_config(),
            },
            network.transport("solo"),
            log_store::shared(InmemLogStore::new()),
            applied_tx,
        )
        .unwrap();
        (node, applied_rx)
    }

    async fn wait_for_role(node: &NodeHandle, role: Role) -> NodeStatus {
        let mut status = node.subscribe();
        let status = timeout(
            Duration::from_secs(2),
            status.wait_for(|status| status.role == role),
        )
        .await
        .expect("role reached in time")
        .expect("node alive");
        status.clone()
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits_alone() {
        let (node, mut applied) = single_node();

        let status = wait_for_role(&node, Role::Leader).await;
        assert_eq!(status.term, 1);
        assert_eq!(status.leader.as_deref(), Some("solo"));

        let index = node.propose(b"x=1".to_vec()).await.unwrap();
        assert_eq!(index, 1);
        let entry = applied.recv().await.unwrap();
        assert_eq!(entry.command, b"x=1");
        assert_eq!(node.status().commit_index, 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_node_refuses_work() {
        let (node, _applied) = single_node();
        node.shutdown().await;
        node.shutdown().await;

        assert_eq!(node.status().role, Role::Stopped);
        assert!(matches!(
            node.propose(b"x=1".to_vec()).await,
            Err(RaftError::Stopped)
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_spawning() {
        let network = LocalNetwork::new(Duration::from_millis(50));
        let result = spawn_node(
            NodeConfig {
                cluster: Cluster::new("a", vec!["b".into()]).unwrap(),
                config: Config {
                    heartbeat_interval: Duration::from_secs(5),
                    ..Config::default()
                },
            },
            network.transport("a"),
            log_store::shared(InmemLogStore::new()),
            mpsc::unbounded_channel::<LogEntry>().0,
        );
        assert!(result.is_err());
    }
}
