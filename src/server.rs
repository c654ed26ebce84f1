//! The consensus state machine of one node, without timers or I/O. Callers feed it timeouts and RPCs and carry
//! out the requests it hands back.

use super::error::{Error, Result};
use super::publisher::{Applied, CommitPublisher, StateMachine};
use super::rpc::*;
use super::state::{Replication, Role, ServerState};
use super::storage::{Storage, StorageError};
use super::{LogIndex, NodeId, Term};
use log::{error, trace};

pub const DEFAULT_MAX_ENTRIES_PER_APPEND: usize = 64;

pub struct Server<S, M> {
    state: ServerState<S>,
    publisher: CommitPublisher,
    state_machine: M,
    max_entries: usize,
}

impl<S: Storage, M: StateMachine> Server<S, M> {
    /// Recover a node from `storage`. `peers` are the other members of the cluster.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: S,
        state_machine: M,
    ) -> std::result::Result<Self, StorageError> {
        Ok(Self {
            state: ServerState::recover(id, peers, storage)?,
            publisher: CommitPublisher::new(),
            state_machine,
            max_entries: DEFAULT_MAX_ENTRIES_PER_APPEND,
        })
    }

    /// Limit how many entries go into a single AppendEntries request.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        assert!(max_entries > 0, "an append batch holds at least one entry");
        self.max_entries = max_entries;
        self
    }

    pub fn get_state(&self) -> &ServerState<S> {
        &self.state
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    pub fn id(&self) -> NodeId {
        self.state.id()
    }

    pub fn peers(&self) -> &[NodeId] {
        self.state.peers()
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.publisher.last_applied()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.leader_id()
    }

    /// No messages have been received over the election timeout.
    /// # Followers:
    /// - If election timeout elapses without receiving AppendEntries RPC from current leader or granting vote to candidate: convert to candidate
    /// # Candidates:
    /// - If election timeout elapses: start new election
    ///
    /// The returned request goes to every peer. A leader ignores the timeout.
    pub fn election_timeout(&mut self) -> Result<Option<RequestVoteRequest>> {
        if self.state.is_leader() {
            return Ok(None);
        }
        Ok(Some(self.state.start_election()?))
    }

    pub fn receive_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        trace!("{}; <- {:?}", self.id(), req);
        self.state.receive_request_vote(req)
    }

    /// Count a vote; true once this node has won the election.
    pub fn receive_vote(&mut self, from: NodeId, res: RequestVoteResponse) -> bool {
        trace!("{}; vote from {}: {:?}", self.id(), from, res);
        self.state.receive_vote(from, res)
    }

    pub fn receive_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        trace!(
            "{}; <- append from {} term {} after ({}, {}) with {} entries",
            self.id(),
            req.leader_id,
            req.term,
            req.prev_log_index,
            req.prev_log_term,
            req.entries.len()
        );
        self.state.receive_append_entries(req)
    }

    /// Upon election: send initial empty AppendEntries RPCs (heartbeat) to each server; repeat during idle periods
    /// to prevent election timeouts. Each request also carries whatever the peer is missing from its `nextIndex`.
    pub fn heartbeat(&self) -> Vec<(NodeId, AppendEntriesRequest)> {
        self.peers()
            .iter()
            .filter_map(|&peer| Some((peer, self.append_request_for(peer)?)))
            .collect()
    }

    pub fn append_request_for(&self, peer: NodeId) -> Option<AppendEntriesRequest> {
        self.state.append_request_for(peer, self.max_entries)
    }

    /// - If successful: update nextIndex and matchIndex for follower
    /// - If AppendEntries fails because of log inconsistency: decrement nextIndex and retry
    pub fn receive_append_entries_response(
        &mut self,
        from: NodeId,
        sent: SentAppend,
        res: AppendEntriesResponse,
    ) -> Replication {
        trace!("{}; append response from {}: {:?}", self.id(), from, res);
        self.state.receive_append_entries_response(from, sent, res)
    }

    /// If command received from client: append entry to local log. The caller learns the outcome from
    /// [`Server::apply_committed`] once the entry at the returned index is applied.
    pub fn command(&mut self, payload: Vec<u8>) -> Result<(LogIndex, Term)> {
        if !self.state.is_leader() {
            return Err(Error::NotLeader {
                leader: self.state.leader_id(),
            });
        }
        Ok(self.state.append_command(payload)?)
    }

    /// If commitIndex > lastApplied: apply the newly committed entries to the state machine, in order.
    pub fn apply_committed(&mut self) -> Vec<Applied> {
        let commit_index = self.state.commit_index();
        let applied = self
            .publisher
            .publish(self.state.log(), commit_index, &mut self.state_machine);
        if self.publisher.last_applied() < commit_index && applied.is_empty() {
            error!(
                "{}; state machine is stuck at {} of {}",
                self.id(),
                self.publisher.last_applied() + 1,
                commit_index
            );
        }
        applied
    }
}

#[cfg(test)]
mod all_server_rules {
    use super::*;
    use crate::log::LogEntry;
    use crate::storage::MemoryStorage;

    #[derive(Default)]
    struct Sum(i64);

    impl StateMachine for Sum {
        type Error = std::convert::Infallible;

        fn apply(&mut self, payload: &[u8]) -> std::result::Result<Vec<u8>, Self::Error> {
            self.0 += payload[0] as i8 as i64;
            Ok(self.0.to_be_bytes().to_vec())
        }
    }

    fn server(id: NodeId, peers: Vec<NodeId>) -> Server<MemoryStorage, Sum> {
        Server::new(id, peers, MemoryStorage::new(), Sum::default()).unwrap()
    }

    #[test]
    fn apply_commited() {
        let mut s = server(55, vec![1, 2]);
        let res = s.receive_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, 1, vec![10]),
                LogEntry::new(2, 1, vec![(-5i8) as u8]),
                LogEntry::new(3, 1, vec![1]),
            ],
            leader_commit: 3,
        });
        assert!(res.success);
        let applied = s.apply_committed();
        assert_eq!(applied.len(), 3);
        assert_eq!(s.state_machine().0, 6);
        assert_eq!(s.last_applied(), 3);
    }

    #[test]
    fn request_updates_term() {
        let mut s = server(55, vec![0, 1]);
        s.election_timeout().unwrap();
        s.receive_request_vote(RequestVoteRequest {
            term: 5,
            candidate_id: 0,
            last_log_term: 1,
            last_log_index: 1,
        });
        assert_eq!(s.current_term(), 5);
        assert_eq!(s.role(), Role::Follower);
    }

    #[test]
    fn leader_ignores_election_timeout() {
        let mut s = server(1, vec![]);
        assert!(s.election_timeout().unwrap().is_some());
        assert!(s.is_leader());
        assert!(s.election_timeout().unwrap().is_none());
        assert_eq!(s.current_term(), 1);
    }

    #[test]
    fn followers_refuse_commands() {
        let mut s = server(1, vec![2, 3]);
        s.receive_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 3,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        match s.command(vec![1]) {
            Err(Error::NotLeader { leader }) => assert_eq!(leader, Some(3)),
            other => panic!("expected NotLeader, got {:?}", other),
        }
    }

    #[test]
    fn single_node_commits_on_append() {
        let mut s = server(1, vec![]);
        s.election_timeout().unwrap();
        let (index, term) = s.command(vec![4]).unwrap();
        assert_eq!((index, term), (1, 1));
        assert_eq!(s.commit_index(), 1);
        let applied = s.apply_committed();
        assert_eq!(applied[0].output, 4i64.to_be_bytes().to_vec());
    }

    #[test]
    fn heartbeat_batches_entries() {
        let mut s = server(1, vec![2]).with_max_entries(2);
        s.election_timeout().unwrap();
        s.receive_vote(
            2,
            RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
        );
        for i in 0..5 {
            s.command(vec![i]).unwrap();
        }
        let heartbeat = s.heartbeat();
        assert_eq!(heartbeat.len(), 1);
        let (peer, req) = &heartbeat[0];
        assert_eq!(*peer, 2);
        assert_eq!(req.prev_log_index, 0);
        assert_eq!(req.entries.len(), 2, "at most max_entries per request");
    }
}
