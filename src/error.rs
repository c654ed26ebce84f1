use super::storage::StorageError;
use super::NodeId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The node could not make its state durable and must not act on it.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed value {value:?} for {key}")]
    Malformed { key: &'static str, value: String },
    #[error("heartbeat interval {heartbeat_ms}ms must be shorter than the election timeout {election_ms}ms")]
    HeartbeatTooSlow { heartbeat_ms: u64, election_ms: u64 },
    #[error("election timeout window {min_ms}..={max_ms}ms is empty")]
    ElectionWindow { min_ms: u64, max_ms: u64 },
    #[error("node {0} is listed more than once")]
    DuplicatePeer(NodeId),
    #[error("node {0} lists itself as a peer")]
    SelfPeer(NodeId),
    #[error("max_entries_per_append must be at least 1")]
    EmptyBatch,
}
