//! Daemon configuration.
//!
//! Loaded from a TOML file by the binary; every field carries a default
//! so a missing file yields a usable development configuration. Paths are
//! not canonicalised here, the consuming component does that when it
//! opens the resource.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of job writer workers.
pub const DEFAULT_RECALL_WORKERS: usize = 32;

/// Default chunk size for tape-to-disk copies.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 512 * 1024;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Path of the embedded queue store file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Unix socket the connector protocol listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Root directory under which tape cartridges are mounted.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    /// Number of tape drives available for concurrent recalls.
    #[serde(default = "default_drives")]
    pub drives: usize,

    /// Filesystems to register with the connector at startup.
    #[serde(default)]
    pub managed_filesystems: Vec<PathBuf>,

    /// Size of the job writer pool.
    #[serde(default = "default_recall_workers")]
    pub recall_workers: usize,

    /// Chunk size for streaming file data off tape.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/tapestage/queue.db")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/tapestage/recall.sock")
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt/tapes")
}

const fn default_drives() -> usize {
    2
}

const fn default_recall_workers() -> usize {
    DEFAULT_RECALL_WORKERS
}

const fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            socket_path: default_socket_path(),
            mount_root: default_mount_root(),
            drives: default_drives(),
            managed_filesystems: Vec::new(),
            recall_workers: default_recall_workers(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl DaemonConfig {
    /// Loads the configuration from `path`.
    ///
    /// A missing file is not an error; it yields [`DaemonConfig::default`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file exists but cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Path of the rollback journal sidecar belonging to `db_path`.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        let mut name = self.db_path.as_os_str().to_os_string();
        name.push("-journal");
        PathBuf::from(name)
    }
}
