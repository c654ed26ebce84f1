use super::log::PersistentLog;
use super::replication::ReplicationCoordinator;
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    SentAppend,
};
use super::storage::{Storage, StorageError};
use super::{LogIndex, NodeId, Term};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Persistent state on all servers: (Updated on stable storage before responding to RPCs)
pub struct Persistent<S> {
    current_term: Term,
    voted_for: Option<NodeId>,
    log: PersistentLog<S>,
}

impl<S: Storage> Persistent<S> {
    pub fn recover(storage: S) -> Result<Self, StorageError> {
        let (current_term, voted_for) = storage.load_term_and_vote()?;
        Ok(Persistent {
            current_term,
            voted_for,
            log: PersistentLog::recover(storage)?,
        })
    }

    /// Write term and vote to storage, and only then to memory.
    /// # Panics
    /// In case the term tries to decrease
    fn save(&mut self, current_term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        assert!(
            current_term >= self.current_term,
            "Current term must increase monotonically, tried to decrease from {} to {}",
            self.current_term,
            current_term
        );
        self.log
            .storage_mut()
            .save_term_and_vote(current_term, voted_for)?;
        self.current_term = current_term;
        self.voted_for = voted_for;
        Ok(())
    }
}

/// Server states. Followers only respond to requests from other servers. If a follower receives no communication,
/// it becomes a candidate and initiates an election. A candidate that receives votes from a majority of the full
/// cluster becomes the new leader. Leaders typically operate until they fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, PartialEq)]
enum States {
    Follower,
    /// votes granted this term, including our own
    Candidate { votes: BTreeSet<NodeId> },
    Leader(ReplicationCoordinator),
}

/// What the leader should do after a follower answered an AppendEntries request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replication {
    /// the follower accepted, its progress moved forward
    Progress,
    /// the follower's log diverges before the request, `nextIndex` stepped back; send again now
    Retry,
    /// `nextIndex` stepped back, but the follower has rejected too many requests in a row; wait for the heartbeat
    Backoff,
    /// the follower is in a later term, this server is no longer leader
    SteppedDown,
    /// the response belongs to an earlier request, term or role and changes nothing
    Ignored,
}

/// Persistent and volatile state of one node, and the rules each RPC obeys on arrival.
pub struct ServerState<S> {
    id: NodeId,
    peers: Vec<NodeId>,
    state: States,
    persistent: Persistent<S>,
    /// index of highest log entry known to be committed (initialized to 0, increases monotonically)
    commit_index: LogIndex,
    leader_id: Option<NodeId>,
    /// a write to storage failed and no sync has succeeded since
    degraded: bool,
}

impl<S: Storage> ServerState<S> {
    /// Start as a follower from whatever `storage` holds.
    pub fn recover(id: NodeId, peers: Vec<NodeId>, storage: S) -> Result<Self, StorageError> {
        let persistent = Persistent::recover(storage)?;
        info!(
            "{}; recovered term {} and {} log entries",
            id,
            persistent.current_term,
            persistent.log.len()
        );
        Ok(ServerState {
            id,
            peers,
            state: States::Follower,
            persistent,
            commit_index: 0,
            leader_id: None,
            degraded: false,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.persistent.voted_for
    }

    pub fn log(&self) -> &PersistentLog<S> {
        &self.persistent.log
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn role(&self) -> Role {
        match self.state {
            States::Follower => Role::Follower,
            States::Candidate { .. } => Role::Candidate,
            States::Leader(_) => Role::Leader,
        }
    }

    pub fn is_follower(&self) -> bool {
        States::Follower == self.state
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.state, States::Candidate { .. })
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state, States::Leader(_))
    }

    /// Replication progress while leader.
    pub fn leader_progress(&self) -> Option<&ReplicationCoordinator> {
        match &self.state {
            States::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    /// # Panics
    /// In case the commit index tries to decrease
    fn set_commit_index(&mut self, commit_index: LogIndex) {
        assert!(
            commit_index >= self.commit_index,
            "Commit index must increase monotonically, tried to decrease from {} to {}",
            self.commit_index,
            commit_index
        );
        self.commit_index = commit_index;
    }

    fn mark_degraded(&mut self, e: &StorageError) {
        if !self.degraded {
            error!("{}; storage failed, refusing votes and appends: {}", self.id, e);
        }
        self.degraded = true;
    }

    /// Re-check storage if a write failed earlier. False while the node must not act on its state.
    fn ensure_durable(&mut self) -> bool {
        if self.degraded {
            match self.persistent.log.storage_mut().sync() {
                Ok(()) => {
                    info!("{}; storage is available again", self.id);
                    self.degraded = false;
                }
                Err(e) => debug!("{}; storage still unavailable: {}", self.id, e),
            }
        }
        !self.degraded
    }

    fn save(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        let saved = self.persistent.save(term, voted_for);
        if let Err(e) = &saved {
            self.mark_degraded(e);
        }
        saved
    }

    /// A term later than ours was observed: set currentTerm = T, convert to follower.
    /// The conversion happens even if the new term can't be persisted, this server must stop acting as leader or
    /// candidate either way.
    pub fn follow_new_term(&mut self, term: Term) -> Result<(), StorageError> {
        if self.is_leader() || self.is_candidate() {
            info!(
                "{}; stepping down in term {}, observed term {}",
                self.id,
                self.current_term(),
                term
            );
        }
        self.state = States::Follower;
        self.leader_id = None;
        self.save(term, None)
    }

    /// Adopt `term` if it is later than ours. False if it could not be persisted; the step down happens anyway,
    /// even on a degraded node.
    fn observe_term(&mut self, term: Term) -> bool {
        term <= self.current_term() || self.follow_new_term(term).is_ok()
    }

    fn has_quorum(&self, votes: usize) -> bool {
        votes > (self.peers.len() + 1) / 2
    }

    /// No messages have been received over the election timeout. Start a new election term:
    /// - Increment currentTerm
    /// - Vote for self
    /// - Reset election timer (to be handled by caller)
    /// - Send RequestVote RPCs to all other servers (the returned request)
    pub fn start_election(&mut self) -> Result<RequestVoteRequest, StorageError> {
        assert!(!self.is_leader(), "a leader does not start elections");
        if !self.ensure_durable() {
            return Err(StorageError::Unavailable);
        }
        let term = self.current_term() + 1;
        self.save(term, Some(self.id))?;
        info!("{}; starting election for term {}", self.id, term);
        self.leader_id = None;
        self.state = States::Candidate {
            votes: std::iter::once(self.id).collect(),
        };
        if self.has_quorum(1) {
            self.become_leader();
        }
        Ok(RequestVoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log().last_index(),
            last_log_term: self.log().last_term(),
        })
    }

    /// Count a response to our RequestVote request; true if this vote won the election.
    pub fn receive_vote(&mut self, from: NodeId, res: RequestVoteResponse) -> bool {
        if res.term > self.current_term() {
            let _ = self.follow_new_term(res.term);
            return false;
        }
        let term = self.current_term();
        let votes = match &mut self.state {
            States::Candidate { votes } if res.term == term && res.vote_granted => {
                votes.insert(from);
                votes.len()
            }
            _ => return false,
        };
        if self.has_quorum(votes) {
            self.become_leader();
            true
        } else {
            false
        }
    }

    /// Win an election and become a leader
    fn become_leader(&mut self) {
        info!(
            "{}; became leader for term {}",
            self.id,
            self.current_term()
        );
        self.leader_id = Some(self.id);
        self.state = States::Leader(ReplicationCoordinator::new(
            self.peers.iter().copied(),
            self.log().last_index(),
        ));
    }

    /// Requested to vote for candidate
    /// 1.  Reply false if term < currentTerm
    /// 2.  If votedFor is null or candidateId, and candidate’s log is at least as up-to-date as receiver’s log, grant vote
    /// The vote is durable before the response exists.
    pub fn receive_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        let vote_granted = self.grant_vote(&req);
        debug!(
            "{}; vote for {} in term {}: {}",
            self.id, req.candidate_id, req.term, vote_granted
        );
        RequestVoteResponse {
            term: self.current_term(),
            vote_granted,
        }
    }

    fn grant_vote(&mut self, req: &RequestVoteRequest) -> bool {
        if req.term < self.current_term() || !self.observe_term(req.term) || !self.ensure_durable() {
            return false;
        }
        let free = match self.voted_for() {
            None => true,
            Some(candidate) => candidate == req.candidate_id,
        };
        if !free || !self.log().is_up_to_date(req.last_log_index, req.last_log_term) {
            return false;
        }
        self.voted_for() == Some(req.candidate_id)
            || self.save(req.term, Some(req.candidate_id)).is_ok()
    }

    /// Invoked by leader to replicate log entries; also used as heartbeat.
    /// 1.  Reply false if term < currentTerm
    /// 2.  Reply false if log doesn’t contain an entry at prevLogIndex whose term matches prevLogTerm
    /// 3.  If an existing entry conflicts with a new one (same index but different terms), delete the existing entry and all that follow it
    /// 4.  Append any new entries not already in the log
    /// 5.  If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
    pub fn receive_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        AppendEntriesResponse {
            success: self.receive_append_entries_int(req),
            term: self.current_term(),
        }
    }

    fn receive_append_entries_int(&mut self, req: AppendEntriesRequest) -> bool {
        // 1.  Reply false if term < currentTerm
        if req.term < self.current_term() || !self.observe_term(req.term) || !self.ensure_durable() {
            return false;
        }
        // A candidate recognizes the leader as legitimate and returns to follower state.
        match self.state {
            States::Leader(_) => {
                error!(
                    "{}; {} claims leadership of term {} which this node leads",
                    self.id, req.leader_id, req.term
                );
                return false;
            }
            States::Candidate { .. } => {
                info!(
                    "{}; {} won the election for term {}",
                    self.id, req.leader_id, req.term
                );
                self.state = States::Follower;
            }
            States::Follower => {}
        }
        self.leader_id = Some(req.leader_id);
        // 2.  Reply false if log doesn’t contain an entry at prevLogIndex whose term matches prevLogTerm
        if !self.log().matches(req.prev_log_index, req.prev_log_term) {
            debug!(
                "{}; no entry ({}, {}) to append after",
                self.id, req.prev_log_index, req.prev_log_term
            );
            return false;
        }
        // 3.  If an existing entry conflicts with a new one, delete the existing entry and all that follow it
        // 4.  Append any new entries not already in the log
        let last_new_entry_index = match self
            .persistent
            .log
            .append_from(req.prev_log_index, req.entries)
        {
            Ok(index) => index,
            Err(e) => {
                self.mark_degraded(&e);
                return false;
            }
        };
        // 5.  If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        let commit = req.leader_commit.min(last_new_entry_index);
        if commit > self.commit_index {
            self.set_commit_index(commit);
        }
        true
    }

    /// The AppendEntries request bringing `peer` up to date, while leader.
    pub fn append_request_for(&self, peer: NodeId, max_entries: usize) -> Option<AppendEntriesRequest> {
        let States::Leader(leader) = &self.state else {
            return None;
        };
        leader.request_for(
            peer,
            self.log(),
            self.current_term(),
            self.id,
            self.commit_index,
            max_entries,
        )
    }

    /// A follower answered the request described by `sent`.
    pub fn receive_append_entries_response(
        &mut self,
        from: NodeId,
        sent: SentAppend,
        res: AppendEntriesResponse,
    ) -> Replication {
        if res.term > self.current_term() {
            let _ = self.follow_new_term(res.term);
            return Replication::SteppedDown;
        }
        let term = self.current_term();
        let States::Leader(leader) = &mut self.state else {
            return Replication::Ignored;
        };
        if sent.term != term {
            return Replication::Ignored;
        }
        if res.success {
            leader.record_success(from, sent.match_index());
            self.advance_commit_index();
            Replication::Progress
        } else if leader.record_mismatch(from, sent.prev_log_index) {
            if leader.retry_now(from) {
                Replication::Retry
            } else {
                Replication::Backoff
            }
        } else {
            Replication::Ignored
        }
    }

    /// Add a command from a client to this leader's log.
    pub fn append_command(&mut self, payload: Vec<u8>) -> Result<(LogIndex, Term), StorageError> {
        assert!(self.is_leader(), "only leaders append commands");
        if !self.ensure_durable() {
            return Err(StorageError::Unavailable);
        }
        let term = self.current_term();
        let index = match self.persistent.log.append(term, payload) {
            Ok(index) => index,
            Err(e) => {
                self.mark_degraded(&e);
                return Err(e);
            }
        };
        self.advance_commit_index();
        Ok((index, term))
    }

    fn advance_commit_index(&mut self) {
        let States::Leader(leader) = &self.state else {
            return;
        };
        if let Some(n) =
            leader.commit_index(&self.persistent.log, self.persistent.current_term, self.commit_index)
        {
            debug!("{}; commit index {} -> {}", self.id, self.commit_index, n);
            self.set_commit_index(n);
        }
    }

    /// Report role, term and, while leading, every peer's replication progress.
    pub fn log_progress(&self) {
        info!(
            "{}; {:?} term {} commit {} last log {}",
            self.id,
            self.role(),
            self.current_term(),
            self.commit_index,
            self.log().last_index()
        );
        if let Some(leader) = self.leader_progress() {
            for (peer, progress) in leader.peers() {
                info!(
                    "{}; peer {} next {} match {}",
                    self.id, peer, progress.next_index, progress.match_index
                );
            }
        }
        if self.degraded {
            warn!("{}; storage degraded", self.id);
        }
    }
}



#[cfg(test)]
mod test_volatile_state {
    use super::test_support::*;
    use super::*;

    #[test]
    fn default() {
        let server = server(0, None, &[]);
        assert_eq!(server.state, States::Follower);
        assert_eq!(server.commit_index, 0);
        assert_eq!(server.leader_id, None);
    }

    #[test]
    fn commit_index_increases() {
        let mut server = server(0, None, &[1, 1]);
        server.set_commit_index(2);
        assert_eq!(server.commit_index, 2);
    }

    #[test]
    #[should_panic]
    fn commit_index_increases_monotonically() {
        let mut server = server(0, None, &[1, 1]);
        server.set_commit_index(2);
        server.set_commit_index(1);
    }
}

#[cfg(test)]
mod test_elections {
    use super::test_support::*;
    use super::*;

    #[test]
    fn start_election() {
        let mut server = server(3, Some(0), &[1, 2]);
        let req = server.start_election().unwrap();
        assert!(server.is_candidate(), "convert to candidate");
        assert_eq!(server.current_term(), 4, "Increment currentTerm");
        assert_eq!(server.voted_for(), Some(1), "Vote for self");
        assert_eq!(
            req,
            RequestVoteRequest {
                term: 4,
                candidate_id: 1,
                last_log_index: 2,
                last_log_term: 2,
            }
        );
        assert_eq!(
            server.log().storage().load_term_and_vote().unwrap(),
            (4, Some(1)),
            "term and self vote are durable before the request exists"
        );
    }

    #[test]
    fn majority_wins() {
        let mut server = server(0, None, &[]);
        server.start_election().unwrap();
        let granted = RequestVoteResponse {
            term: 1,
            vote_granted: true,
        };
        assert!(server.receive_vote(2, granted), "self and one peer are a majority of three");
        assert!(server.is_leader());
        assert_eq!(server.leader_id(), Some(1));
        assert!(!server.receive_vote(0, granted), "already leader");
    }

    #[test]
    fn duplicate_votes_count_once() {
        let mut server =
            ServerState::recover(1, vec![0, 2, 3, 4], crate::storage::MemoryStorage::new()).unwrap();
        server.start_election().unwrap();
        let granted = RequestVoteResponse {
            term: 1,
            vote_granted: true,
        };
        assert!(!server.receive_vote(2, granted));
        assert!(!server.receive_vote(2, granted));
        assert!(server.is_candidate(), "two distinct votes of five are not a majority");
        assert!(server.receive_vote(3, granted));
    }

    #[test]
    fn stale_and_rejected_votes_do_not_count() {
        let mut server = server(4, None, &[]);
        server.start_election().unwrap();
        assert!(!server.receive_vote(
            2,
            RequestVoteResponse {
                term: 4,
                vote_granted: true
            }
        ));
        assert!(!server.receive_vote(
            2,
            RequestVoteResponse {
                term: 5,
                vote_granted: false
            }
        ));
        assert!(server.is_candidate());
    }

    #[test]
    fn later_term_in_vote_response_steps_down() {
        let mut server = server(0, None, &[]);
        server.start_election().unwrap();
        server.receive_vote(
            2,
            RequestVoteResponse {
                term: 6,
                vote_granted: false,
            },
        );
        assert!(server.is_follower());
        assert_eq!(server.current_term(), 6);
        assert_eq!(server.voted_for(), None);
    }

    #[test]
    fn single_node_elects_itself() {
        let mut server = ServerState::recover(7, vec![], crate::storage::MemoryStorage::new()).unwrap();
        server.start_election().unwrap();
        assert!(server.is_leader());
    }

    #[test]
    fn no_election_without_storage() {
        let mut server = server(2, None, &[]);
        server.log().storage().fault_switch().fail();
        assert!(server.start_election().is_err());
        assert!(server.is_follower());
        assert_eq!(server.current_term(), 2);
    }
}
