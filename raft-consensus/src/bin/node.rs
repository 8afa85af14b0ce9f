//! Runs one node of a replicated key-value cluster over HTTP.
//!
//! The same listener serves peer RPCs and the client API, so each node is
//! identified by a single `host:port`.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1
//! cargo run --bin node -- --new --addr 127.0.0.1:8081 --join 127.0.0.1:8082,127.0.0.1:8083
//!
//! # Terminal 2
//! cargo run --bin node -- --new --addr 127.0.0.1:8082 --join 127.0.0.1:8081,127.0.0.1:8083
//!
//! # Terminal 3
//! cargo run --bin node -- --new --addr 127.0.0.1:8083 --join 127.0.0.1:8081,127.0.0.1:8082
//! ```
//!
//! Then write and read through any node:
//! ```bash
//! curl -X POST localhost:8082/store/x -H 'content-type: application/json' -d '{"value":"1"}'
//! curl localhost:8083/store/x
//! curl localhost:8081/status
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueHint};
use tokio::net::TcpListener;
use tracing::{info, warn};

use raft_consensus::http::{AppState, router};
use raft_consensus::log_store::{self, InmemLogStore};
use raft_consensus::store::KvStore;
use raft_consensus::transport::HttpTransport;
use raft_consensus::{Cluster, Config, NodeConfig, spawn_node};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a Raft key-value node")]
struct Args {
    /// Address to serve peers and clients on, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "localhost:8080", value_hint = ValueHint::Hostname)]
    addr: String,

    /// Comma-separated addresses of the other cluster members
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    join: Vec<String>,

    /// Start a fresh node with the given membership
    #[arg(long)]
    new: bool,

    /// Base election timeout; each wait is randomized up to twice this value
    #[arg(long, default_value_t = 300)]
    election_timeout_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let peers = self
            .join
            .iter()
            .map(|peer| peer.trim().to_string())
            .filter(|peer| !peer.is_empty())
            .collect();
        let cluster =
            Cluster::new(self.addr.clone(), peers).context("invalid cluster membership")?;
        let config = Config {
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            ..Config::default()
        };
        Ok(NodeConfig { cluster, config })
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    if !args.new {
        bail!("joining a running cluster is not supported; start every node with --new");
    }

    let node_config = args.node_config()?;
    let transport = HttpTransport::new(node_config.config.rpc_timeout)?;
    let kv = Arc::new(KvStore::new());

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    let node = spawn_node(
        node_config,
        transport,
        log_store::shared(InmemLogStore::new()),
        Arc::clone(&kv),
    )?;
    let app = router(AppState::new(node.clone(), kv)?);

    info!(addr = %args.addr, peers = ?args.join, "serving");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
        .context("HTTP server failed");

    info!("shutting down");
    node.shutdown().await;
    served
}
