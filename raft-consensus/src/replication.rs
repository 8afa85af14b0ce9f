//! Leader-side replication.
//!
//! While a node leads, every peer gets its own [`Replicator`] task that owns
//! the peer's `match_index`/`next_index` and pushes log entries to it. The
//! replicators never touch the node's state directly: they report back to the
//! leader loop over one event channel, and the leader loop owns the per-entry
//! acknowledgment counters in a [`CommitTracker`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Instrument, debug, warn};

use crate::error::RaftError;
use crate::log_store::{SharedLog, StoreError};
use crate::message::{AppendEntriesRequest, LogIndex, Term};
use crate::node::stopped;
use crate::transport::Transport;

/// Resolved with the entry's index once it commits.
pub(crate) type ProposalWaiter = oneshot::Sender<Result<LogIndex, RaftError>>;

/// What a replicator tells the leader loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReplicationEvent {
    /// `peer` newly holds the entries `from..=to`.
    Replicated {
        peer: String,
        from: LogIndex,
        to: LogIndex,
    },
    /// A peer answered with a newer term; this leadership is over.
    HigherTerm(Term),
}

#[derive(Debug)]
struct InflightEntry {
    majority_quorum: usize,
    /// Follower acknowledgments so far. The leader's own copy is counted on top.
    count: usize,
    waiter: Option<ProposalWaiter>,
}

impl InflightEntry {
    fn reached_quorum(&self) -> bool {
        self.count + 1 >= self.majority_quorum
    }
}

/// Entries that just became committed, in index order.
#[derive(Debug)]
pub(crate) struct Committed {
    pub index: LogIndex,
    pub waiters: Vec<(LogIndex, ProposalWaiter)>,
}

/// Acknowledgment counters for the entries proposed during one leadership.
///
/// Entries reach quorum in any order, but they are released only as a
/// contiguous prefix, so the commit index never skips an index.
#[derive(Debug, Default)]
pub(crate) struct CommitTracker {
    inflight: BTreeMap<LogIndex, InflightEntry>,
}

impl CommitTracker {
    pub fn track(&mut self, index: LogIndex, majority_quorum: usize, waiter: Option<ProposalWaiter>) {
        self.inflight.insert(
            index,
            InflightEntry {
                majority_quorum,
                count: 0,
                waiter,
            },
        );
    }

    /// Counts one follower acknowledgment for every tracked entry in `from..=to`.
    ///
    /// Each replicator reports a given index at most once, so an entry's count
    /// never includes the same follower twice.
    pub fn acknowledge(&mut self, from: LogIndex, to: LogIndex) {
        if from > to {
            return;
        }
        for entry in self.inflight.range_mut(from..=to).map(|(_, entry)| entry) {
            entry.count += 1;
        }
    }

    /// Removes and returns the committed prefix, if any entry at its head reached quorum.
    pub fn take_committed(&mut self) -> Option<Committed> {
        let mut committed: Option<Committed> = None;
        while let Some(entry) = self.inflight.first_entry() {
            if !entry.get().reached_quorum() {
                break;
            }
            let (index, entry) = entry.remove_entry();
            let batch = committed.get_or_insert_with(|| Committed {
                index,
                waiters: Vec::new(),
            });
            batch.index = index;
            if let Some(waiter) = entry.waiter {
                batch.waiters.push((index, waiter));
            }
        }
        committed
    }

    /// Fails every pending proposal; called when leadership ends.
    pub fn abandon(self) {
        for (index, entry) in self.inflight {
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Err(RaftError::LeadershipLost { index }));
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inflight.len()
    }
}

/// Everything a replicator needs from the leader that spawned it.
pub(crate) struct ReplicationContext<T> {
    pub leader: String,
    pub term: Term,
    pub transport: Arc<T>,
    pub log: SharedLog,
    pub heartbeat_interval: Duration,
    pub max_append_entries: usize,
    pub events_tx: mpsc::UnboundedSender<ReplicationEvent>,
}

/// Leader-side record for one follower, alive for one leadership tenure.
struct FollowerProgress {
    peer: String,
    notify_tx: mpsc::Sender<()>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The replication loops of one leadership tenure.
pub(crate) struct LeaderTenure {
    followers: Vec<FollowerProgress>,
    commit_tx: watch::Sender<LogIndex>,
}

impl LeaderTenure {
    /// Starts one replicator per peer. Each sends a heartbeat right away.
    pub fn start<T: Transport>(
        ctx: ReplicationContext<T>,
        peers: &[String],
        next_index: LogIndex,
        commit_index: LogIndex,
    ) -> Self {
        let (commit_tx, commit_rx) = watch::channel(commit_index);
        let followers = peers
            .iter()
            .map(|peer| {
                // Capacity one: pending "work exists" signals coalesce.
                let (notify_tx, notify_rx) = mpsc::channel(1);
                let (stop_tx, stop_rx) = watch::channel(false);
                let replicator = Replicator {
                    peer: peer.clone(),
                    leader: ctx.leader.clone(),
                    term: ctx.term,
                    match_index: 0,
                    next_index,
                    transport: Arc::clone(&ctx.transport),
                    log: Arc::clone(&ctx.log),
                    max_append_entries: ctx.max_append_entries,
                    notify_rx,
                    commit_rx: commit_rx.clone(),
                    events_tx: ctx.events_tx.clone(),
                };
                let task = tokio::spawn(
                    replicator
                        .run(stop_rx, ctx.heartbeat_interval)
                        .in_current_span(),
                );
                FollowerProgress {
                    peer: peer.clone(),
                    notify_tx,
                    stop_tx,
                    task,
                }
            })
            .collect();

        Self {
            followers,
            commit_tx,
        }
    }

    /// Wakes every replicator without ever blocking the caller.
    pub fn notify_all(&self) {
        for follower in &self.followers {
            let _ = follower.notify_tx.try_send(());
        }
    }

    pub fn publish_commit(&self, commit_index: LogIndex) {
        self.commit_tx.send_replace(commit_index);
    }

    /// Stops every replicator and waits until all of them have exited.
    pub async fn shutdown(self) {
        for follower in &self.followers {
            follower.stop_tx.send_replace(true);
        }
        let (peers, tasks): (Vec<_>, Vec<_>) = self
            .followers
            .into_iter()
            .map(|follower| (follower.peer, follower.task))
            .unzip();
        for (peer, result) in peers.iter().zip(join_all(tasks).await) {
            if let Err(err) = result {
                warn!(%peer, error = %err, "replication task ended abnormally");
            }
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Pushes the leader's log to a single peer.
struct Replicator<T> {
    peer: String,
    leader: String,
    term: Term,
    match_index: LogIndex,
    next_index: LogIndex,
    transport: Arc<T>,
    log: SharedLog,
    max_append_entries: usize,
    notify_rx: mpsc::Receiver<()>,
    commit_rx: watch::Receiver<LogIndex>,
    events_tx: mpsc::UnboundedSender<ReplicationEvent>,
}

impl<T: Transport> Replicator<T> {
    async fn run(mut self, mut stop: watch::Receiver<bool>, heartbeat_interval: Duration) {
        debug!(peer = %self.peer, next_index = self.next_index, "replication started");
        let mut heartbeat = interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = heartbeat.tick() => {}
                Some(()) = self.notify_rx.recv() => {}
            }

            let flow = tokio::select! {
                _ = stopped(&mut stop) => break,
                flow = self.replicate() => flow,
            };
            if let Flow::Stop = flow {
                break;
            }
            heartbeat.reset();
        }
        debug!(peer = %self.peer, match_index = self.match_index, "replication stopped");
    }

    /// Sends append-entries until the peer is caught up, unreachable, or ahead in term.
    async fn replicate(&mut self) -> Flow {
        loop {
            let request = match self.build_request().await {
                Ok(request) => request,
                Err(err) => {
                    warn!(peer = %self.peer, error = %err, "cannot read log for replication");
                    return Flow::Continue;
                }
            };
            let covered = request.last_covered_index();

            let Some(response) = self.transport.append_entries(&self.peer, request).await else {
                return Flow::Continue;
            };

            if response.term > self.term {
                debug!(peer = %self.peer, term = response.term, "peer is ahead in term");
                let _ = self.events_tx.send(ReplicationEvent::HigherTerm(response.term));
                return Flow::Stop;
            }

            if response.success {
                if covered > self.match_index {
                    let _ = self.events_tx.send(ReplicationEvent::Replicated {
                        peer: self.peer.clone(),
                        from: self.match_index + 1,
                        to: covered,
                    });
                    self.match_index = covered;
                }
                self.next_index = covered + 1;
                if self.next_index > self.log.read().await.last_index() {
                    return Flow::Continue;
                }
                continue;
            }

            if self.next_index <= 1 {
                warn!(peer = %self.peer, "peer rejected entries from the start of the log");
                return Flow::Continue;
            }
            let next_index = (self.next_index - 1)
                .min(response.last_log_index + 1)
                .max(1);
            debug!(
                peer = %self.peer,
                from = self.next_index,
                to = next_index,
                "log mismatch, backing off"
            );
            self.next_index = next_index;
        }
    }

    async fn build_request(&mut self) -> Result<AppendEntriesRequest, StoreError> {
        let log = self.log.read().await;
        let last_index = log.last_index();
        self.next_index = self.next_index.clamp(1, last_index + 1);

        let prev_log_index = self.next_index - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            log.get_log(prev_log_index)?.term
        };

        let end = last_index.min(prev_log_index + self.max_append_entries as LogIndex);
        let entries = (self.next_index..=end)
            .map(|index| log.get_log(index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AppendEntriesRequest {
            term: self.term,
            leader: self.leader.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit_index: *self.commit_rx.borrow(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::{self, InmemLogStore, LogStore};
    use crate::message::{
        AppendEntriesResponse, LogEntry, RequestVoteRequest, RequestVoteResponse,
    };
    use std::sync::Mutex;

    #[test]
    fn entry_commits_once_a_quorum_acknowledges() {
        let mut tracker = CommitTracker::default();
        let (tx, mut rx) = oneshot::channel();
        // Five nodes: quorum of three, the leader plus two followers.
        tracker.track(1, 3, Some(tx));

        tracker.acknowledge(1, 1);
        assert!(tracker.take_committed().is_none());

        tracker.acknowledge(1, 1);
        let committed = tracker.take_committed().expect("quorum reached");
        assert_eq!(committed.index, 1);
        assert_eq!(committed.waiters.len(), 1);
        assert!(rx.try_recv().is_err(), "waiter is resolved by the caller");

        // Late acknowledgments for an already committed entry are ignored.
        tracker.acknowledge(1, 1);
        assert!(tracker.take_committed().is_none());
    }

    #[test]
    fn commit_only_advances_through_a_contiguous_prefix() {
        let mut tracker = CommitTracker::default();
        for index in 1..=3 {
            tracker.track(index, 2, None);
        }

        // Entries 2 and 3 reach quorum first.
        tracker.acknowledge(2, 3);
        assert!(tracker.take_committed().is_none());
        assert_eq!(tracker.len(), 3);

        tracker.acknowledge(1, 1);
        let committed = tracker.take_committed().expect("prefix complete");
        assert_eq!(committed.index, 3);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn single_node_entries_commit_without_acknowledgments() {
        let mut tracker = CommitTracker::default();
        tracker.track(7, 1, None);
        assert_eq!(tracker.take_committed().map(|c| c.index), Some(7));
    }

    #[test]
    fn untracked_indices_are_ignored() {
        let mut tracker = CommitTracker::default();
        tracker.track(5, 2, None);
        tracker.acknowledge(1, 4);
        assert!(tracker.take_committed().is_none());
        tracker.acknowledge(3, 1);
        assert!(tracker.take_committed().is_none());
    }

    #[tokio::test]
    async fn abandoned_proposals_learn_leadership_was_lost() {
        let mut tracker = CommitTracker::default();
        let (tx, rx) = oneshot::channel();
        tracker.track(4, 2, Some(tx));
        tracker.abandon();
        assert!(matches!(
            rx.await.unwrap(),
            Err(RaftError::LeadershipLost { index: 4 })
        ));
    }

    /// Follower stand-in that holds a log of terms and answers append-entries
    /// the way a real follower would, recording every request it sees.
    struct ScriptedPeer {
        terms: Mutex<Vec<Term>>,
        term: Term,
        requests: Mutex<Vec<AppendEntriesRequest>>,
    }

    impl ScriptedPeer {
        fn new(term: Term, terms: Vec<Term>) -> Arc<Self> {
            Arc::new(Self {
                terms: Mutex::new(terms),
                term,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for ScriptedPeer {
        async fn request_vote(
            &self,
            _peer: &str,
            _request: RequestVoteRequest,
        ) -> Option<RequestVoteResponse> {
            None
        }

        async fn append_entries(
            &self,
            _peer: &str,
            request: AppendEntriesRequest,
        ) -> Option<AppendEntriesResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let mut terms = self.terms.lock().unwrap();
            if request.term < self.term {
                return Some(AppendEntriesResponse {
                    term: self.term,
                    last_log_index: terms.len() as LogIndex,
                    success: false,
                });
            }
            let prev = request.prev_log_index as usize;
            let matches = prev == 0 || terms.get(prev - 1) == Some(&request.prev_log_term);
            if !matches {
                return Some(AppendEntriesResponse {
                    term: self.term,
                    last_log_index: terms.len() as LogIndex,
                    success: false,
                });
            }
            terms.truncate(prev);
            terms.extend(request.entries.iter().map(|entry| entry.term));
            Some(AppendEntriesResponse {
                term: self.term,
                last_log_index: terms.len() as LogIndex,
                success: true,
            })
        }
    }

    fn leader_log(terms: &[Term]) -> SharedLog {
        let mut store = InmemLogStore::new();
        let entries: Vec<LogEntry> = terms
            .iter()
            .enumerate()
            .map(|(i, &term)| LogEntry {
                index: i as LogIndex + 1,
                term,
                command: vec![],
            })
            .collect();
        store.set_logs(&entries).unwrap();
        log_store::shared(store)
    }

    fn replicator(
        peer: Arc<ScriptedPeer>,
        log: SharedLog,
        term: Term,
        next_index: LogIndex,
    ) -> (
        Replicator<ScriptedPeer>,
        mpsc::UnboundedReceiver<ReplicationEvent>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (_notify_tx, notify_rx) = mpsc::channel(1);
        let (_commit_tx, commit_rx) = watch::channel(0);
        let replicator = Replicator {
            peer: "b".into(),
            leader: "a".into(),
            term,
            match_index: 0,
            next_index,
            transport: peer,
            log,
            max_append_entries: 2,
            notify_rx,
            commit_rx,
            events_tx,
        };
        (replicator, events_rx)
    }

    #[tokio::test]
    async fn backs_off_past_a_divergent_suffix_then_catches_up() {
        // Follower diverged at index 3 (term 2 where the leader has term 3).
        let peer = ScriptedPeer::new(3, vec![1, 1, 2, 2]);
        let log = leader_log(&[1, 1, 3, 3, 3]);
        let (mut replicator, mut events) = replicator(Arc::clone(&peer), log, 3, 6);

        assert!(matches!(replicator.replicate().await, Flow::Continue));

        assert_eq!(*peer.terms.lock().unwrap(), vec![1, 1, 3, 3, 3]);
        assert_eq!(replicator.match_index, 5);
        assert_eq!(replicator.next_index, 6);

        // Batches are capped at two entries, so the catch-up arrives in pieces
        // and each piece is reported once.
        let mut acknowledged = Vec::new();
        while let Ok(ReplicationEvent::Replicated { from, to, .. }) = events.try_recv() {
            acknowledged.push((from, to));
        }
        assert_eq!(acknowledged, vec![(1, 4), (5, 5)]);
        assert!(
            peer.requests
                .lock()
                .unwrap()
                .iter()
                .all(|request| request.entries.len() <= 2)
        );
    }

    #[tokio::test]
    async fn higher_term_reply_ends_replication() {
        let peer = ScriptedPeer::new(9, vec![]);
        let (mut replicator, mut events) = replicator(peer, leader_log(&[1]), 4, 2);

        assert!(matches!(replicator.replicate().await, Flow::Stop));
        assert_eq!(events.try_recv().unwrap(), ReplicationEvent::HigherTerm(9));
    }

    #[tokio::test]
    async fn heartbeat_to_a_caught_up_peer_reports_nothing_new() {
        let peer = ScriptedPeer::new(2, vec![2]);
        let (mut replicator, mut events) = replicator(Arc::clone(&peer), leader_log(&[2]), 2, 2);
        replicator.match_index = 1;

        assert!(matches!(replicator.replicate().await, Flow::Continue));
        assert!(events.try_recv().is_err());

        let requests = peer.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].entries.is_empty());
        assert_eq!(requests[0].prev_log_index, 1);
        assert_eq!(requests[0].prev_log_term, 2);
    }
}
