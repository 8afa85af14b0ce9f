use thiserror::Error;

use crate::log_store::StoreError;
use crate::message::LogIndex;

/// Failures reported by a node to its callers.
///
/// Protocol rejections (stale term, log mismatch, vote already cast) are not
/// errors: they travel in-band in the RPC responses. This type covers the cases
/// where a request could not be served at all.
#[derive(Debug, Error)]
pub enum RaftError {
    /// Proposals are only accepted by the leader. Carries the best-known leader.
    #[error("not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    /// Leadership was lost before the proposal at `index` committed.
    ///
    /// The entry may still be committed by a later leader.
    #[error("leadership lost before entry {index} committed")]
    LeadershipLost { index: LogIndex },

    /// The node has stopped and no longer serves requests.
    #[error("node is stopped")]
    Stopped,

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// A leader sent an entry that disagrees with one already committed here.
    #[error("conflicting entry at committed index {index}")]
    CommittedConflict { index: LogIndex },

    #[error("log storage failed: {0}")]
    Storage(#[from] StoreError),
}
