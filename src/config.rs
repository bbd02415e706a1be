//! WolfMesh Configuration
//!
//! Configuration structures for a WolfMesh replication node. Every
//! component receives the section it needs through its constructor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Main WolfMesh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfMeshConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Synchronization tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Worker pool sizing
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: Uuid,

    /// Data directory for transaction logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum number of positions in one transfer batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Maximum number of entries applied per apply round
    #[serde(default = "default_apply_batch_size")]
    pub apply_batch_size: usize,

    /// How long shutdown waits for in-flight transfer jobs
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Async worker threads (0 = one per core)
    #[serde(default)]
    pub worker_threads: usize,

    /// Blocking job pool size
    #[serde(default = "default_blocking_threads")]
    pub blocking_threads: usize,
}

/// Cluster configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Optional static topology snapshot (JSON) published at startup
    #[serde(default)]
    pub topology: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmesh")
}

fn default_batch_size() -> u64 {
    1000
}

fn default_apply_batch_size() -> usize {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_blocking_threads() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            apply_batch_size: default_apply_batch_size(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl SyncConfig {
    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            blocking_threads: default_blocking_threads(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfMeshConfig {
    /// Create a configuration with defaults for the given node
    pub fn new(id: Uuid, data_dir: PathBuf) -> Self {
        Self {
            node: NodeConfig { id, data_dir },
            sync: SyncConfig::default(),
            runtime: RuntimeConfig::default(),
            cluster: ClusterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("cannot serialize config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_nil() {
            return Err(crate::Error::Config("node.id cannot be the nil UUID".into()));
        }

        if self.sync.batch_size == 0 {
            return Err(crate::Error::Config("sync.batch_size must be positive".into()));
        }

        if self.sync.apply_batch_size == 0 {
            return Err(crate::Error::Config("sync.apply_batch_size must be positive".into()));
        }

        if self.runtime.blocking_threads == 0 {
            return Err(crate::Error::Config("runtime.blocking_threads must be positive".into()));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be 'pretty' or 'compact', got '{}'",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the transaction log directory path
    pub fn trlog_dir(&self) -> PathBuf {
        self.node.data_dir.join("trlog")
    }
}
