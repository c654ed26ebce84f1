//! Static cluster configuration, supplied at startup.

use super::error::ConfigError;
use super::storage::{FileStorage, StorageError};
use super::NodeId;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Another member of the cluster and where its RPC endpoint listens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

/// Timing values are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub id: NodeId,
    pub port: u16,
    /// every other member of the cluster
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    /// must be shorter than `election_timeout_min`
    pub heartbeat_interval: u64,
    pub rpc_timeout: u64,
    pub command_timeout: u64,
    pub status_interval: u64,
    pub max_entries_per_append: usize,
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            id: 0,
            port: 4040,
            peers: vec![],
            election_timeout_min: 500,
            election_timeout_max: 1000,
            heartbeat_interval: 50,
            rpc_timeout: 250,
            command_timeout: 5500,
            status_interval: 1000,
            max_entries_per_append: super::server::DEFAULT_MAX_ENTRIES_PER_APPEND,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Config {
    /// Read the configuration from the process environment, see [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a configuration from variables:
    /// - `ID`: this node's id
    /// - `PORT`: port this node listens on
    /// - `NODES`: comma separated `id:host:port` for every member, this node's own entry is skipped
    /// - `TIMER`: election timeout base, timeouts are drawn from `TIMER..=2*TIMER`
    /// - `HEARTBEAT_TIMER`: heartbeat interval
    /// - `DATA_DIR`: where the node keeps its log
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(id) = var("ID") {
            config.id = parse("ID", &id)?;
        }
        if let Some(port) = var("PORT") {
            config.port = parse("PORT", &port)?;
        }
        if let Some(nodes) = var("NODES") {
            config.peers = parse_nodes(&nodes)?
                .into_iter()
                .filter(|peer| peer.id != config.id)
                .collect();
        }
        if let Some(timer) = var("TIMER") {
            config.election_timeout_min = parse("TIMER", &timer)?;
            config.election_timeout_max = config
                .election_timeout_min
                .checked_mul(2)
                .ok_or_else(|| ConfigError::Malformed {
                    key: "TIMER",
                    value: timer.clone(),
                })?;
        }
        if let Some(heartbeat) = var("HEARTBEAT_TIMER") {
            config.heartbeat_interval = parse("HEARTBEAT_TIMER", &heartbeat)?;
        }
        if let Some(dir) = var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::ElectionWindow {
                min_ms: self.election_timeout_min,
                max_ms: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat_ms: self.heartbeat_interval,
                election_ms: self.election_timeout_min,
            });
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::EmptyBatch);
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == self.id {
                return Err(ConfigError::SelfPeer(peer.id));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::DuplicatePeer(peer.id));
            }
        }
        Ok(())
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|peer| peer.id).collect()
    }

    /// This node's storage, in its own directory under `data_dir`.
    pub fn open_storage(&self) -> Result<FileStorage, StorageError> {
        FileStorage::open(self.data_dir.join(format!("node-{}", self.id)))
    }

    pub fn election_timeout(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min),
            Duration::from_millis(self.election_timeout_max),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Malformed {
        key,
        value: value.to_string(),
    })
}

fn parse_nodes(nodes: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    nodes
        .split(',')
        .filter(|node| !node.trim().is_empty())
        .map(|node| {
            let malformed = || ConfigError::Malformed {
                key: "NODES",
                value: node.to_string(),
            };
            let mut parts = node.trim().split(':');
            let (Some(id), Some(host), Some(port), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(malformed());
            };
            Ok(PeerConfig {
                id: id.parse().map_err(|_| malformed())?,
                host: host.to_string(),
                port: port.parse().map_err(|_| malformed())?,
            })
        })
        .collect()
}
