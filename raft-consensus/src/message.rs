//! RPC payloads exchanged between nodes and the envelopes that carry inbound
//! requests into a node's state loop.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::RaftError;

pub type Term = u64;
pub type LogIndex = u64;

/// A single replicated command. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate: String,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader: String,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit_index: LogIndex,
}

impl AppendEntriesRequest {
    /// Highest index this request proves the follower holds once accepted.
    pub fn last_covered_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub last_log_index: LogIndex,
    pub success: bool,
}

/// An inbound request paired with the single-use sink for its answer.
#[derive(Debug)]
pub struct RpcEnvelope<Req, Resp> {
    pub request: Req,
    respond_to: oneshot::Sender<Result<Resp, RaftError>>,
}

impl<Req, Resp> RpcEnvelope<Req, Resp> {
    pub fn new(request: Req) -> (Self, oneshot::Receiver<Result<Resp, RaftError>>) {
        let (respond_to, rx) = oneshot::channel();
        (
            Self {
                request,
                respond_to,
            },
            rx,
        )
    }

    pub fn into_parts(self) -> (Req, Responder<Resp>) {
        (self.request, Responder(self.respond_to))
    }
}

/// Consumes itself on use, so an envelope is answered at most once.
#[derive(Debug)]
pub struct Responder<Resp>(oneshot::Sender<Result<Resp, RaftError>>);

impl<Resp> Responder<Resp> {
    pub fn respond(self, result: Result<Resp, RaftError>) {
        // The caller may have given up waiting; nothing to do then.
        let _ = self.0.send(result);
    }
}

/// The inbound request kinds a node understands.
#[derive(Debug)]
pub enum Rpc {
    RequestVote(RpcEnvelope<RequestVoteRequest, RequestVoteResponse>),
    AppendEntries(RpcEnvelope<AppendEntriesRequest, AppendEntriesResponse>),
}

/// Delivers inbound RPCs to a running node and waits for the answer.
///
/// This is the receiving half of every transport: HTTP handlers and the
/// in-process network both funnel requests through it.
#[derive(Debug, Clone)]
pub struct RpcSender {
    tx: mpsc::Sender<Rpc>,
}

impl RpcSender {
    pub(crate) fn new(tx: mpsc::Sender<Rpc>) -> Self {
        Self { tx }
    }

    pub async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        let (envelope, rx) = RpcEnvelope::new(request);
        self.deliver(Rpc::RequestVote(envelope), rx).await
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        let (envelope, rx) = RpcEnvelope::new(request);
        self.deliver(Rpc::AppendEntries(envelope), rx).await
    }

    async fn deliver<Resp>(
        &self,
        rpc: Rpc,
        rx: oneshot::Receiver<Result<Resp, RaftError>>,
    ) -> Result<Resp, RaftError> {
        self.tx.send(rpc).await.map_err(|_| RaftError::Stopped)?;
        // A dropped envelope means the node stopped before answering.
        rx.await.map_err(|_| RaftError::Stopped)?
    }
}
