//! Configuration for a constellation node

use crate::crypto::KeyPair;
use crate::quantum::Role;
use crate::types::PublicKey;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity and constellation membership
    pub node: NodeConfig,

    /// Snapshot cadence and quorum
    pub snapshot: SnapshotConfig,

    /// Quantum handler configuration
    pub handler: HandlerConfig,

    /// Persistence configuration
    pub storage: StorageConfig,

    /// Metrics listen address
    pub metrics_listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            snapshot: SnapshotConfig::default(),
            handler: HandlerConfig::default(),
            storage: StorageConfig::default(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Leader or witness
    pub role: Role,

    /// Ed25519 secret seed (hex)
    pub secret_seed: String,

    /// Leader public key (witness only; the leader uses its own key)
    pub alpha: Option<PublicKey>,

    /// Auditor set the genesis snapshot must match
    pub default_auditors: Vec<PublicKey>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Leader,
            secret_seed: String::new(),
            alpha: None,
            default_auditors: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Signing key from the configured seed
    pub fn keypair(&self) -> Result<KeyPair> {
        KeyPair::from_hex_seed(&self.secret_seed)
    }

    /// Public key of the leader
    pub fn alpha_key(&self, keypair: &KeyPair) -> Result<PublicKey> {
        match (self.role, self.alpha) {
            (Role::Leader, _) => Ok(keypair.public_key()),
            (Role::Witness, Some(alpha)) => Ok(alpha),
            (Role::Witness, None) => Err(Error::Config(
                "Witness requires the alpha public key".to_string(),
            )),
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Interval between leader snapshots (milliseconds)
    pub interval_ms: u64,

    /// Time allowed to collect auditor signatures (milliseconds)
    pub quorum_timeout_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,      // 1 minute
            quorum_timeout_ms: 10_000, // 10s
        }
    }
}

impl SnapshotConfig {
    /// Snapshot interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Quorum timeout
    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_timeout_ms)
    }
}

/// Quantum handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Bounded mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// RocksDB tuning
    pub rocksdb: RocksDBConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/quantum"),
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64, // 64 MB
            max_write_buffer_number: 4,
            target_file_size_mb: 64, // 64 MB
            max_background_jobs: 4,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(role) = std::env::var("QUANTUM_ROLE") {
            config.node.role = match role.to_ascii_lowercase().as_str() {
                "leader" => Role::Leader,
                "witness" => Role::Witness,
                other => return Err(Error::Config(format!("Unknown role: {}", other))),
            };
        }

        if let Ok(seed) = std::env::var("QUANTUM_SECRET_SEED") {
            config.node.secret_seed = seed;
        }

        if let Ok(alpha) = std::env::var("QUANTUM_ALPHA") {
            config.node.alpha = Some(PublicKey::from_hex(&alpha)?);
        }

        if let Ok(auditors) = std::env::var("QUANTUM_DEFAULT_AUDITORS") {
            config.node.default_auditors = auditors
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PublicKey::from_hex)
                .collect::<Result<_>>()?;
        }

        if let Ok(interval) = std::env::var("QUANTUM_SNAPSHOT_INTERVAL_MS") {
            config.snapshot.interval_ms = interval
                .parse()
                .map_err(|e| Error::Config(format!("Invalid snapshot interval: {}", e)))?;
        }

        if let Ok(data_dir) = std::env::var("QUANTUM_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("QUANTUM_METRICS_ADDR") {
            config.metrics_listen_addr = addr;
        }

        Ok(config)
    }
}
