//! HTTP surface of a node: peer RPCs, the key-value API and a status page.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::command::CommandPayload;
use crate::error::RaftError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, LogIndex, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::node::{NodeStatus, Role};
use crate::runtime::NodeHandle;
use crate::store::KvStore;

/// Marks a request already forwarded once, so it is never bounced again.
const FORWARDED_HEADER: &str = "x-raft-forwarded-by";

/// How long a write waits for its entry to commit.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(4);

/// Forwarded writes wait for the leader to commit.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub key: String,
    pub value: String,
    pub index: LogIndex,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error("key {0} not found")]
    NotFound(String),

    #[error("no leader known")]
    NoLeader,

    #[error("{0:#}")]
    Upstream(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Raft(RaftError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Raft(RaftError::Storage(_) | RaftError::CommittedConflict { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Raft(_) | ApiError::NoLeader => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        let leader = match &self {
            ApiError::Raft(RaftError::NotLeader { leader }) => leader.clone(),
            _ => None,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.to_string(), "leader": leader })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    node: NodeHandle,
    store: Arc<KvStore>,
    client: reqwest::Client,
}

impl AppState {
    pub fn new(node: NodeHandle, store: Arc<KvStore>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            node,
            store,
            client,
        })
    }

    /// Replays a client request against the known leader and relays its answer.
    async fn forward(
        &self,
        method: Method,
        key: &str,
        body: Option<&WriteRequest>,
        headers: &HeaderMap,
    ) -> Result<Response, ApiError> {
        if let Some(origin) = headers.get(FORWARDED_HEADER) {
            debug!(?origin, %key, "refusing to forward a forwarded request");
            return Err(ApiError::NoLeader);
        }
        let Some(leader) = self.node.status().leader else {
            return Err(ApiError::NoLeader);
        };

        debug!(%leader, %method, %key, "forwarding to leader");
        let url = format!("http://{leader}/store/{key}");
        let mut request = self
            .client
            .request(method, &url)
            .header(FORWARDED_HEADER, self.node.addr());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to reach leader {leader}"))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read response from leader {leader}"))?;
        Ok((status, [(header::CONTENT_TYPE, "application/json")], bytes).into_response())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/request_vote", post(request_vote))
        .route("/append_entries", post(append_entries))
        .route("/store/:key", get(read_key).post(write_key))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn request_vote(
    State(state): State<AppState>,
    Json(request): Json<RequestVoteRequest>,
) -> Result<Json<RequestVoteResponse>, ApiError> {
    let response = state.node.rpc_sender().request_vote(request).await?;
    Ok(Json(response))
}

async fn append_entries(
    State(state): State<AppState>,
    Json(request): Json<AppendEntriesRequest>,
) -> Result<Json<AppendEntriesResponse>, ApiError> {
    let response = state.node.rpc_sender().append_entries(request).await?;
    Ok(Json(response))
}

async fn status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.node.status())
}

async fn read_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if state.node.status().role != Role::Leader {
        return state.forward(Method::GET, &key, None, &headers).await;
    }
    match state.store.get(&key) {
        Some(value) => Ok(Json(KeyValue { key, value }).into_response()),
        None => Err(ApiError::NotFound(key)),
    }
}

async fn write_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<WriteRequest>,
) -> Result<Response, ApiError> {
    if state.node.status().role != Role::Leader {
        return state.forward(Method::POST, &key, Some(&body), &headers).await;
    }

    let command = CommandPayload::Put {
        key: key.clone(),
        value: body.value.clone(),
    }
    .encode()?;
    let index = tokio::time::timeout(COMMIT_TIMEOUT, state.node.propose(command))
        .await
        .unwrap_or(Err(RaftError::Timeout))
        .map_err(|err| {
            warn!(%key, error = %err, "write failed");
            err
        })?;

    Ok(Json(WriteResponse {
        key,
        value: body.value,
        index,
    })
    .into_response())
}
