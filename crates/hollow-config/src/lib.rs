//! # hollow-config
//!
//! Daemon configuration and logging bootstrap.
//!
//! Configuration lives as JSON in the state directory. Library crates emit
//! `tracing` events only; [`init_logging`] is called exactly once, by the
//! binary.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable controlling the log filter.
pub const LOG_ENV_VAR: &str = "HOLLOWFS_LOG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// One configured mount: where it appears and where its private state
/// (overlay, snapshots) lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub mount_path: PathBuf,
    pub state_directory: PathBuf,
    #[serde(default)]
    pub bind_mounts: Vec<PathBuf>,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HollowConfig {
    /// Daemon state directory; the lock file and takeover socket live here.
    pub state_directory: PathBuf,
    /// Mounts to project, keyed by a human-readable name.
    #[serde(default)]
    pub mounts: BTreeMap<String, MountConfig>,
}

impl HollowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Default state directory: `~/.hollowfs`.
    pub fn default_state_directory() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".hollowfs")
    }

    pub fn with_state_directory(state_directory: PathBuf) -> Self {
        HollowConfig {
            state_directory,
            mounts: BTreeMap::new(),
        }
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.state_directory.join("daemon.lock")
    }

    pub fn takeover_socket_path(&self) -> PathBuf {
        self.state_directory.join("takeover.sock")
    }

    pub fn admin_socket_path(&self) -> PathBuf {
        self.state_directory.join("admin.sock")
    }
}

impl Default for HollowConfig {
    fn default() -> Self {
        Self::with_state_directory(Self::default_state_directory())
    }
}

/// Install the global tracing subscriber, filtered by `HOLLOWFS_LOG`
/// (default `info`).
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = HollowConfig::with_state_directory(dir.path().to_path_buf());
        config.mounts.insert(
            "repo".to_string(),
            MountConfig {
                mount_path: PathBuf::from("/mnt/repo"),
                state_directory: dir.path().join("clients/repo"),
                bind_mounts: vec![PathBuf::from("/mnt/repo/out")],
            },
        );
        config.save(&path).unwrap();

        let loaded = HollowConfig::load(&path).unwrap();
        assert_eq!(loaded.state_directory, config.state_directory);
        assert_eq!(loaded.mounts.len(), 1);
        assert_eq!(
            loaded.mounts["repo"].mount_path,
            PathBuf::from("/mnt/repo")
        );
    }

    #[test]
    fn test_derived_paths() {
        let config = HollowConfig::with_state_directory(PathBuf::from("/srv/hollow"));
        assert_eq!(
            config.lock_file_path(),
            PathBuf::from("/srv/hollow/daemon.lock")
        );
        assert_eq!(
            config.takeover_socket_path(),
            PathBuf::from("/srv/hollow/takeover.sock")
        );
        assert_eq!(
            config.admin_socket_path(),
            PathBuf::from("/srv/hollow/admin.sock")
        );
    }

    #[test]
    fn test_missing_mounts_key_defaults_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"state_directory": "/srv/hollow"}"#).unwrap();
        let loaded = HollowConfig::load(&path).unwrap();
        assert!(loaded.mounts.is_empty());
    }
}
