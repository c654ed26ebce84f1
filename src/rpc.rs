//! Raft servers communicate using remote procedure calls (RPCs), and the basic consensus algorithm requires only
//! two types of RPCs. RequestVote RPCs are initiated by candidates during elections, and AppendEntries RPCs are
//! initiated by leaders to replicate log entries and to provide a form of heartbeat. Servers retry RPCs if they do
//! not receive a response in a timely manner, and they issue RPCs in parallel for best performance.
//!
//! The types are plain values; encoding them is left to whichever codec the transport uses.

use super::log::LogEntry;
use super::{LogIndex, NodeId, Term};
use actix::Message;
use serde::{Deserialize, Serialize};

/// Invoked by leader to replicate log entries; also used as heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Message)]
#[rtype(result = "AppendEntriesResponse")]
pub struct AppendEntriesRequest {
    /// leader’s term
    pub term: Term,
    /// so follower can redirect clients
    pub leader_id: NodeId,
    /// index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,
    /// term of prevLogIndex entry
    pub prev_log_term: Term,
    /// log entries to store (empty for heartbeat; may send more than one for efficiency)
    pub entries: Vec<LogEntry>,
    /// leader’s commitIndex
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Index the follower will match up to once it accepts this request.
    pub fn match_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// currentTerm, for leader to update itself
    pub term: Term,
    /// true if follower contained entry matching prevLogIndex and prevLogTerm
    pub success: bool,
}

/// What the leader needs to remember about an AppendEntries request while its response is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentAppend {
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub entries: usize,
}

impl From<&AppendEntriesRequest> for SentAppend {
    fn from(req: &AppendEntriesRequest) -> Self {
        SentAppend {
            term: req.term,
            prev_log_index: req.prev_log_index,
            entries: req.entries.len(),
        }
    }
}

impl SentAppend {
    pub fn match_index(&self) -> LogIndex {
        self.prev_log_index + self.entries as LogIndex
    }
}

/// Invoked by candidates to gather votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Message)]
#[rtype(result = "RequestVoteResponse")]
pub struct RequestVoteRequest {
    /// candidate’s term
    pub term: Term,
    /// candidate requesting vote
    pub candidate_id: NodeId,
    /// index of candidate’s last log entry
    pub last_log_index: LogIndex,
    /// term of candidate’s last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// currentTerm, for candidate to update itself
    pub term: Term,
    /// true means candidate received vote
    pub vote_granted: bool,
}
