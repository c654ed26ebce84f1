//! Scenarios for clusters driven through the `Server` api directly: no timers, no serialisation and no async.
//! Every RPC is delivered by hand, so each test decides exactly which messages arrive and in what order.

use raft_application::rpc::*;
use raft_application::*;

#[derive(Default)]
struct Sum(i64);

impl StateMachine for Sum {
    type Error = std::convert::Infallible;

    fn apply(&mut self, payload: &[u8]) -> Result<Vec<u8>, Self::Error> {
        self.0 += payload[0] as i64;
        Ok(self.0.to_be_bytes().to_vec())
    }
}

struct TestServer {
    api: Server<MemoryStorage, Sum>,
}

impl TestServer {
    fn new(id: NodeId, peers: Vec<NodeId>, current_term: Term, log: Vec<LogEntry>) -> TestServer {
        let storage = MemoryStorage::with_state(current_term, None, log);
        TestServer {
            api: Server::new(id, peers, storage, Sum::default()).unwrap(),
        }
    }

    fn value(&self) -> i64 {
        self.api.state_machine().0
    }

    fn log_terms(&self) -> Vec<Term> {
        self.api.get_state().log().iter().map(|entry| entry.term).collect()
    }
}

fn log_of(terms: &[Term]) -> Vec<LogEntry> {
    terms
        .iter()
        .enumerate()
        .map(|(i, &term)| LogEntry::new(i as LogIndex + 1, term, vec![term as u8]))
        .collect()
}

fn cluster(size: NodeId) -> Vec<TestServer> {
    (0..size)
        .map(|id| {
            let peers = (0..size).filter(|&peer| peer != id).collect();
            TestServer::new(id, peers, 0, vec![])
        })
        .collect()
}

/// Deliver one AppendEntries request from `leader` to the follower `to` and hand the answer back.
fn deliver(
    leader: &mut TestServer,
    follower: &mut TestServer,
    to: NodeId,
    req: AppendEntriesRequest,
) -> (AppendEntriesResponse, state::Replication) {
    let sent = SentAppend::from(&req);
    let res = follower.api.receive_append_entries(req);
    let outcome = leader.api.receive_append_entries_response(to, sent, res);
    (res, outcome)
}

/// Replicate until the follower holds the leader's whole log; returns how many requests it took.
fn sync(leader: &mut TestServer, follower: &mut TestServer, to: NodeId) -> usize {
    for round in 1..=20 {
        let req = leader.api.append_request_for(to).unwrap();
        let reaches_end = req.match_index() == leader.api.get_state().log().last_index();
        let (res, _) = deliver(leader, follower, to, req);
        if res.success && reaches_end {
            return round;
        }
    }
    panic!("follower {} never caught up", to);
}

#[test]
fn happy_path() {
    // cluster of 3 servers
    let mut servers = cluster(3);

    // If a follower receives no communication over a period of time called the election timeout, then it assumes
    // there is no viable leader and begins an election to choose a new leader.
    let vote_request = servers[0].api.election_timeout().unwrap().unwrap();
    assert_eq!(vote_request.term, 1);
    // It votes for itself and issues RequestVote RPCs in parallel to each of the other servers in the cluster.
    let vote = servers[1].api.receive_request_vote(vote_request);
    let won1 = servers[0].api.receive_vote(1, vote);
    let vote = servers[2].api.receive_request_vote(vote_request);
    let won2 = servers[0].api.receive_vote(2, vote);
    // In this three server cluster, the first vote is enough for a majority.
    assert!(won1);
    assert!(!won2);
    assert!(servers[0].api.is_leader());

    // the announcement is an AppendEntries request without entries, sent to each of the other servers
    let (leader, followers) = servers.split_at_mut(1);
    let leader = &mut leader[0];
    for (peer, req) in leader.api.heartbeat() {
        assert!(req.entries.is_empty());
        let (res, _) = deliver(leader, &mut followers[peer as usize - 1], peer, req);
        assert!(res.success);
        assert_eq!(followers[peer as usize - 1].api.leader_id(), Some(0));
    }
    assert!(leader.api.apply_committed().is_empty());

    // we can now give it a command, which is not applied yet
    let (index, term) = leader.api.command(vec![11]).unwrap();
    assert_eq!((index, term), (1, 1));
    assert_eq!(leader.value(), 0);

    // once the first follower has replicated the command there is a majority, so it commits
    for (count, (peer, req)) in leader.api.heartbeat().into_iter().enumerate() {
        let (res, _) = deliver(leader, &mut followers[peer as usize - 1], peer, req);
        assert!(res.success);
        let applied = leader.api.apply_committed();
        if count == 0 {
            assert_eq!(applied.len(), 1);
            assert_eq!(applied[0].index, index);
            assert_eq!(leader.value(), 11);
        } else {
            assert!(applied.is_empty());
        }
        // the followers don't know about the commit yet
        assert!(followers[peer as usize - 1].api.apply_committed().is_empty());
    }

    // the next heartbeat carries the commit index
    for (peer, req) in leader.api.heartbeat() {
        assert_eq!(req.leader_commit, 1);
        let follower = &mut followers[peer as usize - 1];
        let (res, _) = deliver(leader, follower, peer, req);
        assert!(res.success);
        follower.api.apply_committed();
        assert_eq!(follower.value(), 11);
    }
}

mod elections {
    use super::*;

    // While waiting for votes, a candidate may receive an AppendEntries RPC from another server claiming to be
    // leader. If the leader’s term is at least as large as the candidate’s current term, then the candidate
    // recognizes the leader as legitimate and returns to follower state.
    #[test]
    fn candidate_loses() {
        let mut servers = cluster(3);
        let req0 = servers[0].api.election_timeout().unwrap().unwrap();
        servers[2].api.election_timeout().unwrap();
        let vote = servers[1].api.receive_request_vote(req0);
        assert!(servers[0].api.receive_vote(1, vote));

        let (_, req) = servers[0].api.heartbeat().remove(1);
        let res = servers[2].api.receive_append_entries(req);
        assert!(res.success);
        assert_eq!(servers[2].api.role(), Role::Follower);
        assert_eq!(servers[2].api.leader_id(), Some(0));
    }

    // If the term in the RPC is smaller than the candidate’s current term, then the candidate rejects the RPC and
    // continues in candidate state.
    #[test]
    fn old_leader_returns() {
        let mut servers = cluster(3);
        let req = servers[0].api.election_timeout().unwrap().unwrap();
        let vote = servers[1].api.receive_request_vote(req);
        assert!(servers[0].api.receive_vote(1, vote));
        let (_, stale) = servers[0].api.heartbeat().remove(1);

        servers[2].api.election_timeout().unwrap();
        servers[2].api.election_timeout().unwrap();
        let res = servers[2].api.receive_append_entries(stale);
        assert_eq!(
            res,
            AppendEntriesResponse {
                term: 2,
                success: false
            }
        );
        assert_eq!(servers[2].api.role(), Role::Candidate);
    }

    // If many followers become candidates at the same time, votes could be split so that no candidate obtains a
    // majority. Each candidate times out and starts a new election with a higher term.
    #[test]
    fn split_vote() {
        let mut servers = cluster(4);
        let req0 = servers[0].api.election_timeout().unwrap().unwrap();
        let req1 = servers[1].api.election_timeout().unwrap().unwrap();
        let vote = servers[2].api.receive_request_vote(req0);
        assert!(!servers[0].api.receive_vote(2, vote));
        let vote = servers[3].api.receive_request_vote(req1);
        assert!(!servers[1].api.receive_vote(3, vote));
        // both candidates have their own vote and one more, a majority of 4 needs 3
        let vote = servers[1].api.receive_request_vote(req0);
        assert!(!vote.vote_granted);
        assert!(!servers[0].api.receive_vote(1, vote));

        let retry = servers[0].api.election_timeout().unwrap().unwrap();
        assert_eq!(retry.term, 2);
        let votes: Vec<_> = (1..4)
            .map(|id| servers[id].api.receive_request_vote(retry))
            .collect();
        assert!(votes.iter().all(|vote| vote.vote_granted));
        assert!(votes
            .into_iter()
            .enumerate()
            .any(|(i, vote)| servers[0].api.receive_vote(i as NodeId + 1, vote)));
        assert!(servers[0].api.is_leader());
    }

    // A candidate whose log is behind can't collect votes from servers with a more complete log.
    #[test]
    fn stale_log_loses() {
        let mut behind = TestServer::new(0, vec![1, 2], 2, log_of(&[1]));
        let mut ahead = TestServer::new(1, vec![0, 2], 2, log_of(&[1, 2]));
        let req = behind.api.election_timeout().unwrap().unwrap();
        let vote = ahead.api.receive_request_vote(req);
        assert!(!vote.vote_granted);
        // the term is still adopted
        assert_eq!(ahead.api.current_term(), 3);
        assert!(!behind.api.receive_vote(1, vote));
    }
}

/// Scenarios from Figure 7 of the Raft paper. A leader comes to power and its follower doesn't match, it needs
/// some more entries, some removed, or both. The leader forces the follower to duplicate its own log.
mod leader_catch_up {
    use super::*;

    const LEADER_LOG: [Term; 10] = [1, 1, 1, 4, 4, 5, 5, 6, 6, 6];

    fn leader() -> TestServer {
        let mut server = TestServer::new(0, vec![1, 2], 7, log_of(&LEADER_LOG));
        let req = server.api.election_timeout().unwrap().unwrap();
        assert_eq!(req.term, 8);
        server.api.receive_vote(
            2,
            RequestVoteResponse {
                vote_granted: true,
                term: req.term,
            },
        );
        assert!(server.api.is_leader());
        server
    }

    fn follower(terms: &[Term]) -> TestServer {
        TestServer::new(1, vec![0, 2], 0, log_of(terms))
    }

    fn catch_up(terms: &[Term]) -> (TestServer, TestServer, usize) {
        let mut leader = leader();
        let mut follower = follower(terms);
        let rounds = sync(&mut leader, &mut follower, 1);
        // only entries of the current term commit by counting replicas
        assert_eq!(leader.api.commit_index(), 0);
        (leader, follower, rounds)
    }

    #[test]
    fn a() {
        let (_, follower, rounds) = catch_up(&[1, 1, 1, 4, 4, 5, 5, 6, 6]);
        assert_eq!(rounds, 2);
        assert_eq!(follower.log_terms(), LEADER_LOG);
    }

    #[test]
    fn b() {
        let (_, follower, rounds) = catch_up(&[1, 1, 1, 4]);
        assert_eq!(rounds, 7);
        assert_eq!(follower.log_terms(), LEADER_LOG);
    }

    // the follower has an extra entry which matches the leader's prefix, it only goes once the leader overwrites it
    #[test]
    fn c() {
        let (mut leader, mut follower, rounds) = catch_up(&[1, 1, 1, 4, 4, 5, 5, 6, 6, 6, 6]);
        assert_eq!(rounds, 1);
        assert_eq!(follower.log_terms()[..10], LEADER_LOG);
        leader.api.command(vec![1]).unwrap();
        sync(&mut leader, &mut follower, 1);
        assert_eq!(follower.log_terms(), [&LEADER_LOG[..], &[8][..]].concat());
        assert_eq!(leader.api.commit_index(), 11);
    }

    #[test]
    fn d() {
        let (mut leader, mut follower, rounds) = catch_up(&[1, 1, 1, 4, 4, 5, 5, 6, 6, 6, 7, 7]);
        assert_eq!(rounds, 1);
        assert_eq!(follower.log_terms()[..10], LEADER_LOG);
        leader.api.command(vec![1]).unwrap();
        sync(&mut leader, &mut follower, 1);
        assert_eq!(follower.log_terms(), [&LEADER_LOG[..], &[8][..]].concat());
    }

    #[test]
    fn e() {
        let (_, follower, rounds) = catch_up(&[1, 1, 1, 4, 4, 4, 4]);
        assert_eq!(rounds, 6);
        assert_eq!(follower.log_terms(), LEADER_LOG);
    }

    #[test]
    fn f() {
        let (_, follower, rounds) = catch_up(&[1, 1, 1, 2, 2, 2, 3, 3, 3, 3, 3]);
        assert_eq!(rounds, 8);
        assert_eq!(follower.log_terms(), LEADER_LOG);
    }
}

// A leader holding entries 5..=7 from term 3 meets a follower with a conflicting entry at index 6. The follower
// rejects until the leader has stepped back to the last matching entry, then drops its suffix and accepts.
#[test]
fn conflicting_suffix_is_replaced() {
    let mut leader = TestServer::new(0, vec![1, 2], 3, log_of(&[1, 1, 1, 1, 3, 3, 3]));
    let req = leader.api.election_timeout().unwrap().unwrap();
    leader.api.receive_vote(
        2,
        RequestVoteResponse {
            term: req.term,
            vote_granted: true,
        },
    );
    let mut follower = TestServer::new(1, vec![0, 2], 3, log_of(&[1, 1, 1, 1, 3, 2]));

    let mut attempts = vec![];
    loop {
        let req = leader.api.append_request_for(1).unwrap();
        let prev = (req.prev_log_index, req.prev_log_term);
        let (res, outcome) = deliver(&mut leader, &mut follower, 1, req);
        attempts.push((prev, res.success));
        if res.success {
            break;
        }
        assert_eq!(outcome, state::Replication::Retry);
    }
    assert_eq!(
        attempts,
        vec![((7, 3), false), ((6, 3), false), ((5, 3), true)]
    );
    assert_eq!(follower.log_terms(), vec![1, 1, 1, 1, 3, 3, 3]);
    let progress = leader.api.get_state().leader_progress().unwrap();
    assert_eq!(progress.progress(1).unwrap().match_index, 7);
    assert_eq!(progress.progress(1).unwrap().next_index, 8);
}

// An entry from an earlier term is not committed by counting replicas, only once an entry of the leader's own
// term is replicated on a majority.
#[test]
fn prior_term_entries_commit_indirectly() {
    let mut leader = TestServer::new(0, vec![1, 2], 2, log_of(&[1, 2]));
    let req = leader.api.election_timeout().unwrap().unwrap();
    assert_eq!(req.term, 3);
    let mut follower = TestServer::new(1, vec![0, 2], 2, log_of(&[1]));
    let vote = follower.api.receive_request_vote(req);
    assert!(leader.api.receive_vote(1, vote));

    sync(&mut leader, &mut follower, 1);
    assert_eq!(follower.log_terms(), vec![1, 2]);
    assert_eq!(leader.api.commit_index(), 0, "term 2 entry is on a majority but not committed");

    let (index, _) = leader.api.command(vec![5]).unwrap();
    assert_eq!(index, 3);
    sync(&mut leader, &mut follower, 1);
    assert_eq!(leader.api.commit_index(), 3);
    let applied = leader.api.apply_committed();
    assert_eq!(
        applied.iter().map(|applied| applied.index).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(leader.value(), 1 + 2 + 5);
}

// Partition isolates the leader; the others elect a new leader with a higher term. Once healed, the old leader
// sees the higher term in a response and steps down, and its uncommitted entry is replaced.
#[test]
fn partitioned_leader_steps_down() {
    let mut servers = cluster(3);
    let req = servers[0].api.election_timeout().unwrap().unwrap();
    let vote = servers[1].api.receive_request_vote(req);
    assert!(servers[0].api.receive_vote(1, vote));
    // accepted while partitioned, never replicated
    servers[0].api.command(vec![7]).unwrap();

    let req = servers[1].api.election_timeout().unwrap().unwrap();
    assert_eq!(req.term, 2);
    let vote = servers[2].api.receive_request_vote(req);
    assert!(servers[1].api.receive_vote(2, vote));
    servers[1].api.command(vec![9]).unwrap();
    {
        let (left, right) = servers.split_at_mut(2);
        sync(&mut left[1], &mut right[0], 2);
    }
    assert_eq!(servers[1].api.commit_index(), 1);

    // healed: the old leader's heartbeat is answered with the newer term
    let (old_leader, rest) = servers.split_at_mut(1);
    let old_leader = &mut old_leader[0];
    let (peer, req) = old_leader.api.heartbeat().remove(0);
    assert_eq!(peer, 1);
    let (res, outcome) = deliver(old_leader, &mut rest[0], 1, req);
    assert_eq!(
        res,
        AppendEntriesResponse {
            term: 2,
            success: false
        }
    );
    assert_eq!(outcome, state::Replication::SteppedDown);
    assert_eq!(old_leader.api.role(), Role::Follower);
    assert_eq!(old_leader.api.current_term(), 2);
    assert!(old_leader.api.command(vec![1]).is_err());

    sync(&mut rest[0], old_leader, 0);
    assert_eq!(old_leader.log_terms(), vec![2]);
    old_leader.api.apply_committed();
    assert_eq!(old_leader.value(), 9);
}

// Term, vote and log survive a restart on file storage; volatile state starts again from zero.
#[test]
fn restart_from_file_storage() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = FileStorage::open(dir.path()).unwrap();
        let mut server = Server::new(1, vec![], storage, Sum::default()).unwrap();
        server.election_timeout().unwrap();
        server.command(vec![2]).unwrap();
        server.command(vec![3]).unwrap();
        assert_eq!(server.apply_committed().len(), 2);
    }

    let storage = FileStorage::open(dir.path()).unwrap();
    let mut server = Server::new(1, vec![], storage, Sum::default()).unwrap();
    assert_eq!(server.current_term(), 1);
    assert_eq!(server.get_state().voted_for(), Some(1));
    assert_eq!(server.get_state().log().last_index(), 2);
    assert_eq!(server.commit_index(), 0);
    assert_eq!(server.role(), Role::Follower);

    server.election_timeout().unwrap();
    assert_eq!(server.current_term(), 2);
    server.command(vec![4]).unwrap();
    assert_eq!(server.commit_index(), 3);
    server.apply_committed();
    assert_eq!(server.state_machine().0, 9);
}
