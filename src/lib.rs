//! Leader election and log replication core of a Raft replicated state machine.
//!
//! The consensus rules live in [`state`] and [`server`] and never touch a clock or a socket:
//! every input is a value, every output is a value. [`runtime::Node`] wraps a [`server::Server`]
//! in an actor which owns the timers and fans RPCs out through a [`transport::Transport`].

pub type NodeId = u64;
/// Time is divided into terms, and each term begins with an election. After a successful election, a single leader
/// manages the cluster until the end of the term. Some elections fail, in which case the term ends without choosing
/// a leader. The transitions between terms may be observed at different times on different servers.
pub type Term = u64;
/// Position of an entry in the log, the first entry has index 1 and 0 means "before the first entry".
pub type LogIndex = u64;

pub mod config;
mod error;
pub mod log;
pub mod publisher;
pub mod replication;
pub mod rpc;
pub mod runtime;
pub mod server;
pub mod state;
pub mod storage;
pub mod timer;
pub mod transport;

pub use config::{Config, PeerConfig};
pub use error::{ConfigError, Error, Result};
pub use self::log::{LogEntry, PersistentLog};
pub use publisher::{Applied, StateMachine};
pub use runtime::{ClientCommand, CommandError, GetStatus, Node, NodeStatus};
pub use server::Server;
pub use state::Role;
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use transport::{LocalNetwork, Transport, TransportError};
