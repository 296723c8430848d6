//! Broker configuration.
//!
//! All knobs the broker consumes: the listener, the manager identity, the
//! dead-letter and admin queues, session limits, housekeeping, the peer
//! manager table, statically predefined queues, per-user credentials, and the
//! backup-storage settings. Loaded from a TOML file, with defaults suitable
//! for a single-node development broker.

use ferrumq_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Backup-file rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Maximum active backup file size before rotation (bytes)
    pub max_file_size: u64,

    /// Check the file size only every this many record writes
    pub check_every_writes: u64,

    /// Maximum number of retained generation files
    pub max_generations: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_file_size: 16 * 1024 * 1024, // 16MB
            check_every_writes: 64,
            max_generations: 3,
        }
    }
}

impl RotationConfig {
    /// Validate the rotation configuration.
    ///
    /// # Errors
    /// Returns an error if any field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(Error::Configuration {
                message: "max_file_size must be greater than 0".to_string(),
            });
        }
        if self.check_every_writes == 0 {
            return Err(Error::Configuration {
                message: "check_every_writes must be greater than 0".to_string(),
            });
        }
        if self.max_generations == 0 {
            return Err(Error::Configuration {
                message: "max_generations must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Queue backup-storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding per-queue backup files
    pub backup_dir: PathBuf,

    /// Disable a queue's backup writer after this many write errors
    pub max_write_errors: u32,

    /// Rotation policy for backup files
    pub rotation: RotationConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./data"),
            max_write_errors: 3,
            rotation: RotationConfig::default(),
        }
    }
}

/// Housekeeping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    /// Enable the periodic housekeeping task
    pub enabled: bool,

    /// Interval between housekeeping passes (milliseconds)
    pub interval_ms: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self { enabled: true, interval_ms: 30_000 }
    }
}

/// A statically configured queue definition applied at activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedQueue {
    /// Queue name
    pub name: String,
    /// Capacity threshold
    pub threshold: usize,
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Whether the server accepts requests at all
    pub enabled: bool,

    /// Listen address
    pub bind_address: SocketAddr,

    /// Name of this queue manager
    pub manager_name: String,

    /// Name of the dead-letter queue
    pub dead_letter_queue: String,

    /// Name of the administrative queue
    pub admin_queue: String,

    /// User allowed to issue Shutdown
    pub admin_user: String,

    /// Maximum concurrent sessions
    pub max_sessions: usize,

    /// Per-session consecutive error budget before the session is closed
    pub max_session_errors: u32,

    /// Socket read timeout per request (milliseconds)
    pub socket_timeout_ms: u64,

    /// Default capacity threshold for queues defined without one
    pub default_threshold: usize,

    /// Housekeeping task settings
    pub housekeeping: HousekeepingConfig,

    /// Peer queue managers: name -> host:port
    pub peers: HashMap<String, String>,

    /// Queues defined at every activation
    pub predefined_queues: Vec<PredefinedQueue>,

    /// Per-user credential table (user -> hashed password)
    pub credentials: HashMap<String, String>,

    /// Backup storage settings
    pub storage: StorageConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:7474".parse().expect("valid default address"),
            manager_name: "QMGR1".to_string(),
            dead_letter_queue: "DEAD.LETTER.QUEUE".to_string(),
            admin_queue: "ADMIN.QUEUE".to_string(),
            admin_user: "admin".to_string(),
            max_sessions: 256,
            max_session_errors: 3,
            socket_timeout_ms: 30_000,
            default_threshold: 1_000,
            housekeeping: HousekeepingConfig::default(),
            peers: HashMap::new(),
            predefined_queues: Vec::new(),
            credentials: HashMap::new(),
            storage: StorageConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
            message: format!("cannot read config file {}: {e}", path.display()),
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| Error::Configuration {
            message: format!("cannot parse config file {}: {e}", path.display()),
        })?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any field is out of range or inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.manager_name.trim().is_empty() {
            return Err(Error::Configuration {
                message: "manager_name must not be empty".to_string(),
            });
        }
        if self.max_sessions == 0 {
            return Err(Error::Configuration {
                message: "max_sessions must be greater than 0".to_string(),
            });
        }
        if self.socket_timeout_ms == 0 {
            return Err(Error::Configuration {
                message: "socket_timeout_ms must be greater than 0".to_string(),
            });
        }
        if self.default_threshold == 0 {
            return Err(Error::Configuration {
                message: "default_threshold must be greater than 0".to_string(),
            });
        }
        if self.housekeeping.enabled && self.housekeeping.interval_ms == 0 {
            return Err(Error::Configuration {
                message: "housekeeping.interval_ms must be greater than 0 when enabled"
                    .to_string(),
            });
        }
        if self.peers.contains_key(&self.manager_name) {
            return Err(Error::Configuration {
                message: format!("peer table must not contain this manager ({})", self.manager_name),
            });
        }
        self.storage.rotation.validate()?;
        Ok(())
    }
}
