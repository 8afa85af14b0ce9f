//! The consensus state machine of a single node.
//!
//! [`Core`] owns all node state and runs on one task. Inbound RPCs, client
//! proposals, vote responses and replication reports all arrive as messages,
//! so nothing here is shared or locked except the log itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
};
use tracing::{Instrument, debug, error, info, warn};

use crate::config::Config;
use crate::error::RaftError;
use crate::log_store::{SharedLog, StoreError};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, LogIndex, RequestVoteRequest,
    RequestVoteResponse, Rpc, Term,
};
use crate::replication::{CommitTracker, LeaderTenure, ReplicationContext, ReplicationEvent};
use crate::store::StateMachine;
use crate::timer::ElectionTimer;
use crate::topology::Cluster;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

/// Read-only snapshot of a node, published after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: String,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<String>,
    pub leader: Option<String>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

impl NodeStatus {
    pub(crate) fn initial(id: &str) -> Self {
        Self {
            id: id.to_string(),
            role: Role::Follower,
            term: 0,
            voted_for: None,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            last_log_term: 0,
        }
    }
}

/// A client command waiting to be appended by the leader.
#[derive(Debug)]
pub(crate) struct Proposal {
    pub command: Vec<u8>,
    pub respond_to: oneshot::Sender<Result<LogIndex, RaftError>>,
}

/// Receiving ends of everything that drives a node.
pub(crate) struct Inbox {
    pub rpc_rx: mpsc::Receiver<Rpc>,
    pub proposal_rx: mpsc::Receiver<Proposal>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Resolves once a stop is requested or the stop sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum Event {
    Stop,
    Rpc(Rpc),
    Proposal(Proposal),
    Vote(RequestVoteResponse),
    Replication(ReplicationEvent),
    ElectionTimeout,
}

/// Votes gathered during one candidacy.
struct Election {
    votes_rx: mpsc::Receiver<RequestVoteResponse>,
    votes_granted: usize,
    timer: ElectionTimer,
}

pub(crate) struct Core<T> {
    cluster: Cluster,
    config: Config,
    transport: Arc<T>,
    log: SharedLog,
    state_machine: Box<dyn StateMachine>,

    role: Role,
    current_term: Term,
    voted_for: Option<String>,
    leader: Option<String>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    last_log_index: LogIndex,
    last_log_term: Term,

    inbox: Inbox,
    status_tx: watch::Sender<NodeStatus>,
}

impl<T: Transport> Core<T> {
    pub fn new(
        cluster: Cluster,
        config: Config,
        transport: Arc<T>,
        log: SharedLog,
        state_machine: Box<dyn StateMachine>,
        inbox: Inbox,
        status_tx: watch::Sender<NodeStatus>,
    ) -> Self {
        Self {
            cluster,
            config,
            transport,
            log,
            state_machine,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            last_log_term: 0,
            inbox,
            status_tx,
        }
    }

    pub async fn run(mut self) {
        if let Err(err) = self.load_last_log().await {
            error!(error = %err, "cannot read the last log entry, starting from an empty view");
        }
        info!(
            peers = ?self.cluster.peers(),
            last_log_index = self.last_log_index,
            "node started"
        );

        loop {
            self.publish_status();
            match self.role {
                Role::Follower => self.run_follower().await,
                Role::Candidate => self.run_candidate().await,
                Role::Leader => self.run_leader().await,
                Role::Stopped => break,
            }
        }

        self.publish_status();
        info!(term = self.current_term, "node stopped");
    }

    /// Waits for a leader. The election timer restarts only on append-entries
    /// at or above the current term and on a granted vote; other RPCs leave it running.
    async fn run_follower(&mut self) {
        info!(term = self.current_term, "entering follower state");
        let mut timer = ElectionTimer::new(self.config.election_timeout);

        while self.role == Role::Follower {
            let event = select! {
                _ = stopped(&mut self.inbox.shutdown_rx) => Event::Stop,
                Some(rpc) = self.inbox.rpc_rx.recv() => Event::Rpc(rpc),
                Some(proposal) = self.inbox.proposal_rx.recv() => Event::Proposal(proposal),
                _ = &mut timer => Event::ElectionTimeout,
            };

            match event {
                Event::Stop => self.role = Role::Stopped,
                Event::Rpc(rpc) => {
                    if self.process_rpc(rpc).await {
                        timer.reset();
                    }
                }
                Event::Proposal(proposal) => self.reject_proposal(proposal),
                Event::ElectionTimeout => {
                    info!(
                        term = self.current_term,
                        leader = ?self.leader,
                        "election timeout elapsed"
                    );
                    self.role = Role::Candidate;
                }
                Event::Vote(_) | Event::Replication(_) => {}
            }
            self.publish_status();
        }
    }

    async fn run_candidate(&mut self) {
        info!(term = self.current_term, "entering candidate state");
        let mut election = self.start_election();

        while self.role == Role::Candidate {
            if election.votes_granted >= self.cluster.quorum_size() {
                info!(
                    term = self.current_term,
                    votes = election.votes_granted,
                    "won election"
                );
                self.role = Role::Leader;
                self.leader = Some(self.cluster.local().to_string());
                break;
            }

            let event = select! {
                _ = stopped(&mut self.inbox.shutdown_rx) => Event::Stop,
                Some(vote) = election.votes_rx.recv() => Event::Vote(vote),
                Some(rpc) = self.inbox.rpc_rx.recv() => Event::Rpc(rpc),
                Some(proposal) = self.inbox.proposal_rx.recv() => Event::Proposal(proposal),
                _ = &mut election.timer => Event::ElectionTimeout,
            };

            match event {
                Event::Stop => self.role = Role::Stopped,
                Event::Vote(vote) => {
                    if self.process_vote_response(vote) {
                        election.votes_granted += 1;
                    }
                }
                Event::Rpc(rpc) => {
                    self.process_rpc(rpc).await;
                }
                Event::Proposal(proposal) => self.reject_proposal(proposal),
                Event::ElectionTimeout => {
                    info!(
                        term = self.current_term,
                        votes = election.votes_granted,
                        "election timed out, starting a new one"
                    );
                    election = self.start_election();
                }
                Event::Replication(_) => {}
            }
            self.publish_status();
        }
    }

    /// Moves to a fresh term, votes for itself and asks every peer for a vote.
    fn start_election(&mut self) -> Election {
        self.current_term += 1;
        self.voted_for = Some(self.cluster.local().to_string());
        self.leader = None;
        self.publish_status();

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate: self.cluster.local().to_string(),
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        };
        debug!(
            term = request.term,
            last_log_index = request.last_log_index,
            last_log_term = request.last_log_term,
            "requesting votes"
        );

        let (votes_tx, votes_rx) = mpsc::channel(self.cluster.peers().len().max(1));
        for peer in self.cluster.peers() {
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            let peer = peer.clone();
            let votes_tx = votes_tx.clone();
            tokio::spawn(
                async move {
                    match transport.request_vote(&peer, request).await {
                        Some(response) => {
                            let _ = votes_tx.send(response).await;
                        }
                        None => debug!(%peer, "no vote response"),
                    }
                }
                .in_current_span(),
            );
        }

        Election {
            votes_rx,
            votes_granted: 1,
            timer: ElectionTimer::new(self.config.election_timeout),
        }
    }

    /// Returns whether the response is a vote for the current candidacy.
    fn process_vote_response(&mut self, response: RequestVoteResponse) -> bool {
        if response.term > self.current_term {
            info!(
                term = self.current_term,
                response_term = response.term,
                "vote response carries a newer term"
            );
            self.adopt_term(response.term);
            return false;
        }
        response.vote_granted && response.term == self.current_term
    }

    async fn run_leader(&mut self) {
        info!(term = self.current_term, "entering leader state");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let tenure = LeaderTenure::start(
            ReplicationContext {
                leader: self.cluster.local().to_string(),
                term: self.current_term,
                transport: Arc::clone(&self.transport),
                log: Arc::clone(&self.log),
                heartbeat_interval: self.config.heartbeat_interval,
                max_append_entries: self.config.max_append_entries,
                events_tx,
            },
            self.cluster.peers(),
            self.last_log_index + 1,
            self.commit_index,
        );
        let mut tracker = CommitTracker::default();
        self.publish_status();

        while self.role == Role::Leader {
            let event = select! {
                _ = stopped(&mut self.inbox.shutdown_rx) => Event::Stop,
                Some(rpc) = self.inbox.rpc_rx.recv() => Event::Rpc(rpc),
                Some(proposal) = self.inbox.proposal_rx.recv() => Event::Proposal(proposal),
                Some(event) = events_rx.recv() => Event::Replication(event),
            };

            match event {
                Event::Stop => self.role = Role::Stopped,
                Event::Rpc(rpc) => {
                    self.process_rpc(rpc).await;
                }
                Event::Proposal(proposal) => {
                    self.dispatch(proposal, &mut tracker, &tenure).await;
                }
                Event::Replication(ReplicationEvent::Replicated { peer, from, to }) => {
                    debug!(%peer, from, to, "entries replicated");
                    tracker.acknowledge(from, to);
                    self.advance_commit(&mut tracker, &tenure).await;
                }
                Event::Replication(ReplicationEvent::HigherTerm(term)) => {
                    if term > self.current_term {
                        info!(
                            term = self.current_term,
                            peer_term = term,
                            "peer reported a newer term"
                        );
                        self.adopt_term(term);
                    }
                }
                Event::Vote(_) | Event::ElectionTimeout => {}
            }
            self.publish_status();
        }

        tenure.shutdown().await;
        tracker.abandon();
        info!(term = self.current_term, role = ?self.role, "leadership ended");
    }

    /// Appends a client command to the local log and starts replicating it.
    async fn dispatch(
        &mut self,
        proposal: Proposal,
        tracker: &mut CommitTracker,
        tenure: &LeaderTenure,
    ) {
        let entry = LogEntry {
            index: self.last_log_index + 1,
            term: self.current_term,
            command: proposal.command,
        };
        let index = entry.index;

        if let Err(err) = self.log.write().await.set_log(entry) {
            warn!(index, error = %err, "failed to store proposal");
            let _ = proposal.respond_to.send(Err(err.into()));
            return;
        }
        self.last_log_index = index;
        self.last_log_term = self.current_term;
        debug!(index, term = self.current_term, "entry appended");

        tracker.track(index, self.cluster.quorum_size(), Some(proposal.respond_to));
        tenure.notify_all();
        self.advance_commit(tracker, tenure).await;
    }

    async fn advance_commit(&mut self, tracker: &mut CommitTracker, tenure: &LeaderTenure) {
        let Some(committed) = tracker.take_committed() else {
            return;
        };
        if committed.index > self.commit_index {
            debug!(from = self.commit_index, to = committed.index, "commit index advanced");
            self.commit_index = committed.index;
            tenure.publish_commit(self.commit_index);
            self.apply_committed().await;
            self.publish_status();
        }
        for (index, waiter) in committed.waiters {
            let _ = waiter.send(Ok(index));
        }
    }

    /// Feeds every committed but unapplied entry to the state machine, in order.
    async fn apply_committed(&mut self) {
        if self.last_applied >= self.commit_index {
            return;
        }
        let log = self.log.read().await;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            match log.get_log(index) {
                Ok(entry) => {
                    self.state_machine.apply(&entry);
                    self.last_applied = index;
                }
                Err(err) => {
                    error!(index, error = %err, "committed entry missing from the log");
                    break;
                }
            }
        }
    }

    /// Handles one inbound RPC.
    ///
    /// Returns true when the message should reset the follower's election timer:
    /// append-entries from a current leader, or a granted vote.
    async fn process_rpc(&mut self, rpc: Rpc) -> bool {
        match rpc {
            Rpc::AppendEntries(envelope) => {
                let (request, responder) = envelope.into_parts();
                let from_current_leader = request.term >= self.current_term;
                let result = self.process_append_entries(request).await;
                if let Err(err) = &result {
                    warn!(error = %err, "append entries failed");
                }
                responder.respond(result);
                from_current_leader
            }
            Rpc::RequestVote(envelope) => {
                let (request, responder) = envelope.into_parts();
                let response = self.process_request_vote(request);
                let granted = response.vote_granted;
                responder.respond(Ok(response));
                granted
            }
        }
    }

    async fn process_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        let mut response = AppendEntriesResponse {
            term: self.current_term,
            last_log_index: self.last_log_index,
            success: false,
        };

        if request.term < self.current_term {
            debug!(
                term = self.current_term,
                request_term = request.term,
                leader = %request.leader,
                "rejecting append entries from stale leader"
            );
            return Ok(response);
        }

        if request.term > self.current_term || self.role != Role::Follower {
            self.adopt_term(request.term);
            response.term = self.current_term;
        }
        if self.leader.as_deref() != Some(request.leader.as_str()) {
            info!(leader = %request.leader, term = self.current_term, "following new leader");
            self.leader = Some(request.leader.clone());
        }

        let prev_log_term = if request.prev_log_index == 0 {
            0
        } else if request.prev_log_index == self.last_log_index {
            self.last_log_term
        } else if request.prev_log_index > self.last_log_index {
            debug!(
                prev_log_index = request.prev_log_index,
                last_log_index = self.last_log_index,
                "missing entries before the append point"
            );
            return Ok(response);
        } else {
            match self.log.read().await.get_log(request.prev_log_index) {
                Ok(entry) => entry.term,
                Err(err) => {
                    debug!(error = %err, "cannot read the entry before the append point");
                    return Ok(response);
                }
            }
        };

        if prev_log_term != request.prev_log_term {
            debug!(
                prev_log_index = request.prev_log_index,
                expected_term = request.prev_log_term,
                local_term = prev_log_term,
                "previous log term mismatch"
            );
            return Ok(response);
        }

        if !request.entries.is_empty() {
            self.append_new_entries(&request.entries).await?;
        }

        if request.leader_commit_index > self.commit_index {
            let commit_index = request
                .leader_commit_index
                .min(request.last_covered_index());
            if commit_index > self.commit_index {
                debug!(from = self.commit_index, to = commit_index, "commit index advanced");
                self.commit_index = commit_index;
                self.apply_committed().await;
            }
        }

        response.success = true;
        response.last_log_index = self.last_log_index;
        Ok(response)
    }

    /// Writes the part of `entries` the log does not hold yet.
    ///
    /// Entries already present with the same term are skipped. The first entry
    /// whose term differs from the local one removes it and everything after.
    /// An entry that would replace one at or below the commit index is refused
    /// with [`RaftError::CommittedConflict`] and nothing is written.
    async fn append_new_entries(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        let mut log = self.log.write().await;

        let mut skip = 0;
        for entry in entries {
            if entry.index > self.last_log_index {
                break;
            }
            let existing = log.get_log(entry.index)?;
            if existing.term != entry.term {
                if entry.index <= self.commit_index {
                    error!(
                        index = entry.index,
                        commit_index = self.commit_index,
                        "leader sent a conflicting committed entry"
                    );
                    return Err(RaftError::CommittedConflict { index: entry.index });
                }
                info!(
                    from = entry.index,
                    to = self.last_log_index,
                    "truncating conflicting entries"
                );
                log.delete_range(entry.index, self.last_log_index + 1)?;
                self.last_log_index = entry.index - 1;
                self.last_log_term = if self.last_log_index == 0 {
                    0
                } else {
                    log.get_log(self.last_log_index)?.term
                };
                break;
            }
            skip += 1;
        }

        let fresh = &entries[skip..];
        let Some(last) = fresh.last() else {
            return Ok(());
        };
        log.set_logs(fresh)?;
        self.last_log_index = last.index;
        self.last_log_term = last.term;
        Ok(())
    }

    fn process_request_vote(&mut self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut response = RequestVoteResponse {
            term: self.current_term,
            vote_granted: false,
        };

        if request.term < self.current_term {
            debug!(
                term = self.current_term,
                candidate = %request.candidate,
                request_term = request.term,
                "rejecting vote for stale term"
            );
            return response;
        }

        if request.term > self.current_term {
            self.adopt_term(request.term);
            response.term = self.current_term;
        } else if let Some(voted_for) = &self.voted_for {
            if voted_for != &request.candidate {
                debug!(
                    candidate = %request.candidate,
                    %voted_for,
                    "already voted this term"
                );
                return response;
            }
        }

        if self.last_log_index > request.last_log_index
            || self.last_log_term > request.last_log_term
        {
            debug!(
                candidate = %request.candidate,
                last_log_index = self.last_log_index,
                last_log_term = self.last_log_term,
                "candidate log is behind"
            );
            return response;
        }

        info!(candidate = %request.candidate, term = self.current_term, "granting vote");
        self.voted_for = Some(request.candidate);
        response.vote_granted = true;
        response
    }

    /// Moves to `term` if it is newer and falls back to follower.
    fn adopt_term(&mut self, term: Term) {
        if term > self.current_term {
            debug!(from = self.current_term, to = term, "adopting newer term");
            self.current_term = term;
            self.voted_for = None;
            self.leader = None;
        }
        if self.role != Role::Follower && self.role != Role::Stopped {
            info!(from = ?self.role, term = self.current_term, "stepping down to follower");
            self.role = Role::Follower;
        }
    }

    fn reject_proposal(&self, proposal: Proposal) {
        let _ = proposal.respond_to.send(Err(RaftError::NotLeader {
            leader: self.leader.clone(),
        }));
    }

    async fn load_last_log(&mut self) -> Result<(), StoreError> {
        let log = self.log.read().await;
        let last_index = log.last_index();
        self.last_log_term = if last_index == 0 {
            0
        } else {
            log.get_log(last_index)?.term
        };
        self.last_log_index = last_index;
        Ok(())
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.cluster.local().to_string(),
            role: self.role,
            term: self.current_term,
            voted_for: self.voted_for.clone(),
            leader: self.leader.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}
