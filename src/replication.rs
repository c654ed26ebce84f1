//! Volatile state on leaders, reinitialized after each election.

use super::log::PersistentLog;
use super::rpc::AppendEntriesRequest;
use super::storage::Storage;
use super::{LogIndex, NodeId, Term};
use std::collections::BTreeMap;

/// Rejections in a row answered with an immediate resend; after that the leader steps back once per heartbeat.
pub const IMMEDIATE_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    /// index of the next log entry to send to that server (initialized to leader last log index + 1)
    pub next_index: LogIndex,
    /// index of highest log entry known to be replicated on server (initialized to 0, increases monotonically)
    pub match_index: LogIndex,
    /// rejected requests since the last accepted one
    pub rejections: u32,
}

/// Per-follower replication progress, alive for a single leadership tenure.
#[derive(Debug, PartialEq)]
pub struct ReplicationCoordinator {
    peers: BTreeMap<NodeId, PeerProgress>,
}

impl ReplicationCoordinator {
    pub fn new(peers: impl IntoIterator<Item = NodeId>, last_log_index: LogIndex) -> Self {
        let progress = PeerProgress {
            next_index: last_log_index + 1,
            match_index: 0,
            rejections: 0,
        };
        ReplicationCoordinator {
            peers: peers.into_iter().map(|peer| (peer, progress)).collect(),
        }
    }

    pub fn progress(&self, peer: NodeId) -> Option<PeerProgress> {
        self.peers.get(&peer).copied()
    }

    pub fn peers(&self) -> impl Iterator<Item = (NodeId, PeerProgress)> + '_ {
        self.peers.iter().map(|(&id, &progress)| (id, progress))
    }

    /// The AppendEntries request that brings `peer` up to date from its `nextIndex`, at most `max_entries` long.
    pub fn request_for<S: Storage>(
        &self,
        peer: NodeId,
        log: &PersistentLog<S>,
        term: Term,
        leader_id: NodeId,
        leader_commit: LogIndex,
        max_entries: usize,
    ) -> Option<AppendEntriesRequest> {
        let next_index = self.peers.get(&peer)?.next_index;
        let prev_log_index = next_index - 1;
        let prev_log_term = log
            .term_at(prev_log_index)
            .expect("nextIndex never passes the leader's last log index + 1");
        Some(AppendEntriesRequest {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: log.entries_from(next_index, max_entries),
            leader_commit,
        })
    }

    /// The follower accepted a request and now matches the leader up to `match_index`.
    /// Responses can arrive out of order, so progress only ever moves forward.
    pub fn record_success(&mut self, peer: NodeId, match_index: LogIndex) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.match_index = progress.match_index.max(match_index);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            progress.rejections = 0;
        }
    }

    /// The follower's log did not match at `prev_log_index`: step `nextIndex` back by one.
    /// Returns false for responses to requests that no longer reflect the current `nextIndex`.
    pub fn record_mismatch(&mut self, peer: NodeId, prev_log_index: LogIndex) -> bool {
        match self.peers.get_mut(&peer) {
            Some(progress)
                if progress.next_index == prev_log_index + 1
                    && progress.next_index > progress.match_index + 1 =>
            {
                progress.next_index -= 1;
                progress.rejections += 1;
                true
            }
            _ => false,
        }
    }

    /// A follower that keeps rejecting may be refusing everything rather than diverging, so stop resending at once.
    pub fn retry_now(&self, peer: NodeId) -> bool {
        self.peers
            .get(&peer)
            .map_or(false, |progress| progress.rejections <= IMMEDIATE_RETRIES)
    }

    /// Highest index stored on a strict majority of the cluster, counting the leader's own log.
    pub fn majority_match(&self, leader_last_index: LogIndex) -> LogIndex {
        let mut indices: Vec<LogIndex> = self
            .peers
            .values()
            .map(|p| p.match_index)
            .chain(std::iter::once(leader_last_index))
            .collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices[indices.len() / 2]
    }

    /// If there exists an N such that N > commitIndex, a majority of matchIndex[i] ≥ N, and log[N].term ==
    /// currentTerm: the new commitIndex is N. Entries from earlier terms are never committed by counting replicas.
    pub fn commit_index<S: Storage>(
        &self,
        log: &PersistentLog<S>,
        current_term: Term,
        commit_index: LogIndex,
    ) -> Option<LogIndex> {
        let majority = self.majority_match(log.last_index());
        (commit_index + 1..=majority)
            .rev()
            .find(|&n| log.term_at(n) == Some(current_term))
    }
}
