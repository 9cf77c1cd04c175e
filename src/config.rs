//! Runtime configuration.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::NodeId;

/// The default number of partitions of the grid.
pub const DEFAULT_PARTITIONS: u32 = 1024;
/// The default number of backup replicas of each partition.
pub const DEFAULT_BACKUPS: u32 = 1;
/// The default max size of a single transfer segment, 1 MiB.
pub const DEFAULT_TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;
/// The default number of retries of a failed transfer session.
pub const DEFAULT_TRANSFER_MAX_RETRIES: u32 = 3;
/// The default base delay between transfer session retries.
pub const DEFAULT_TRANSFER_RETRY_BACKOFF_MS: u64 = 500;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The consistent ID of this node.
    pub node_id: NodeId,
    /// The port which partition transfer traffic is to use.
    pub server_port: u16,
    /// Statically known peers of this node, formatted as `id=host:port,id=host:port`.
    #[serde(default)]
    pub peers: String,
    /// The parsed form of `peers`, mapping node IDs to their transfer addresses.
    ///
    /// This value is derived from the `peers` value.
    #[serde(skip, default)]
    pub peer_addrs: BTreeMap<NodeId, SocketAddr>,

    /// The path to the database & partition data on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The number of partitions of the grid.
    #[serde(default = "Config::default_partitions")]
    pub partitions: u32,
    /// The number of backup replicas of each partition.
    #[serde(default = "Config::default_backups")]
    pub backups: u32,
    /// The max number of bytes written to a transfer channel in one segment.
    #[serde(default = "Config::default_transfer_chunk_size")]
    pub transfer_chunk_size: usize,
    /// The number of times a failed transfer session is retried before giving up.
    #[serde(default = "Config::default_transfer_max_retries")]
    pub transfer_max_retries: u32,
    /// The base delay in millis between transfer session retries.
    #[serde(default = "Config::default_transfer_retry_backoff_ms")]
    pub transfer_retry_backoff_ms: u64,

    /// Enable baseline auto-adjust when no settings have been persisted yet.
    #[serde(default)]
    pub baseline_auto_adjust_enabled: bool,
    /// The auto-adjust timeout used when no settings have been persisted yet.
    #[serde(default)]
    pub baseline_auto_adjust_timeout_ms: u64,
    /// Request cluster activation once the node has started.
    #[serde(default)]
    pub activate_on_start: bool,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validated()
    }

    /// Validate the given config, deriving any computed fields.
    pub fn validated(mut self) -> Result<Self> {
        if self.node_id.is_empty() {
            bail!("NODE_ID may not be an empty string");
        }
        if self.transfer_chunk_size == 0 {
            bail!("TRANSFER_CHUNK_SIZE must be greater than 0");
        }
        if self.partitions == 0 {
            bail!("PARTITIONS must be greater than 0");
        }
        self.peer_addrs = Self::parse_peers(&self.peers)?;
        Ok(self)
    }

    /// Parse a peers list formatted as `id=host:port,id=host:port`.
    pub fn parse_peers(peers: &str) -> Result<BTreeMap<NodeId, SocketAddr>> {
        peers
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (id, addr) = entry
                    .split_once('=')
                    .with_context(|| format!("invalid peer entry {}, expected format id=host:port", entry))?;
                let addr = addr
                    .trim()
                    .parse::<SocketAddr>()
                    .with_context(|| format!("invalid socket address for peer {}", id))?;
                Ok((id.trim().to_string(), addr))
            })
            .collect()
    }

    /// The retry base delay as a duration.
    pub fn transfer_retry_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.transfer_retry_backoff_ms)
    }

    fn default_partitions() -> u32 {
        DEFAULT_PARTITIONS
    }

    fn default_backups() -> u32 {
        DEFAULT_BACKUPS
    }

    fn default_transfer_chunk_size() -> usize {
        DEFAULT_TRANSFER_CHUNK_SIZE
    }

    fn default_transfer_max_retries() -> u32 {
        DEFAULT_TRANSFER_MAX_RETRIES
    }

    fn default_transfer_retry_backoff_ms() -> u64 {
        DEFAULT_TRANSFER_RETRY_BACKOFF_MS
    }

    /// Build a config instance for testing, backed by a temporary data directory.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir for test config")?;
        let config = Config {
            rust_log: "error".into(),
            node_id: "node-a".into(),
            server_port: 7100,
            peers: String::new(),
            peer_addrs: BTreeMap::new(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            partitions: 16,
            backups: 1,
            transfer_chunk_size: 4 * 1024,
            transfer_max_retries: 2,
            transfer_retry_backoff_ms: 1,
            baseline_auto_adjust_enabled: false,
            baseline_auto_adjust_timeout_ms: 0,
            activate_on_start: false,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
