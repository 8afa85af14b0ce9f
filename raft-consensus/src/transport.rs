//! Outbound RPC delivery.
//!
//! The consensus core only needs two calls to a named peer. A missing response,
//! for whatever reason, is reported as `None` and handled like a timeout.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::debug;

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    RpcSender,
};

pub trait Transport: Send + Sync + 'static {
    fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> impl Future<Output = Option<RequestVoteResponse>> + Send;

    fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> impl Future<Output = Option<AppendEntriesResponse>> + Send;
}

/// JSON-over-HTTP transport matching the routes served by [`crate::http::router`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(rpc_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(&self, peer: &str, path: &str, request: &Req) -> Option<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{peer}/{path}");
        let response = match self.client.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(%peer, path, error = %err, "rpc delivery failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(%peer, path, %status, "rpc answered with failure");
            return None;
        }

        match response.json::<Resp>().await {
            Ok(body) => Some(body),
            Err(err) => {
                debug!(%peer, path, error = %err, "rpc response could not be decoded");
                None
            }
        }
    }
}

impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Option<RequestVoteResponse> {
        self.post(peer, "request_vote", &request).await
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Option<AppendEntriesResponse> {
        self.post(peer, "append_entries", &request).await
    }
}

/// In-process network connecting nodes of one process by address.
///
/// Nodes can be cut off with [`LocalNetwork::isolate`] to simulate partitions:
/// requests to or from an isolated node, and responses coming back after the
/// cut, are lost.
#[derive(Debug)]
pub struct LocalNetwork {
    routes: RwLock<HashMap<String, RpcSender>>,
    isolated: RwLock<HashSet<String>>,
    rpc_timeout: Duration,
}

impl LocalNetwork {
    pub fn new(rpc_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            routes: RwLock::new(HashMap::new()),
            isolated: RwLock::new(HashSet::new()),
            rpc_timeout,
        })
    }

    /// Transport used by the node listening at `local`.
    pub fn transport(self: &Arc<Self>, local: impl Into<String>) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
            local: local.into(),
        }
    }

    pub async fn register(&self, addr: impl Into<String>, sender: RpcSender) {
        self.routes.write().await.insert(addr.into(), sender);
    }

    pub async fn isolate(&self, addr: &str) {
        self.isolated.write().await.insert(addr.to_string());
    }

    pub async fn heal(&self, addr: &str) {
        self.isolated.write().await.remove(addr);
    }

    async fn is_cut(&self, from: &str, to: &str) -> bool {
        let isolated = self.isolated.read().await;
        isolated.contains(from) || isolated.contains(to)
    }

    async fn route(&self, from: &str, to: &str) -> Option<RpcSender> {
        if self.is_cut(from, to).await {
            return None;
        }
        self.routes.read().await.get(to).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: String,
}

impl LocalTransport {
    async fn call<Fut, Resp>(&self, peer: &str, call: Fut) -> Option<Resp>
    where
        Fut: Future<Output = Result<Resp, crate::error::RaftError>>,
    {
        let result = timeout(self.network.rpc_timeout, call).await;
        if self.network.is_cut(&self.local, peer).await {
            return None;
        }
        match result {
            Ok(Ok(response)) => Some(response),
            Ok(Err(err)) => {
                debug!(from = %self.local, %peer, error = %err, "rpc failed");
                None
            }
            Err(_) => {
                debug!(from = %self.local, %peer, "rpc timed out");
                None
            }
        }
    }
}

impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Option<RequestVoteResponse> {
        let sender = self.network.route(&self.local, peer).await?;
        self.call(peer, sender.request_vote(request)).await
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Option<AppendEntriesResponse> {
        let sender = self.network.route(&self.local, peer).await?;
        self.call(peer, sender.append_entries(request)).await
    }
}
