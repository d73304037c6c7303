//! Collector configuration

use crate::rpc::Credentials;
use crate::{GcError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration values
pub mod defaults {
    /// Seconds between the start of two cycles (5 minutes)
    pub const CYCLE_INTERVAL_SECS: u64 = 300;

    /// Seconds to wait before the first cycle
    pub const INITIAL_DELAY_SECS: u64 = 30;

    /// Per-call RPC timeout in milliseconds
    pub const RPC_TIMEOUT_MS: u64 = 30_000;

    /// Tablet servers contacted concurrently
    pub const MAX_CONCURRENT_RPCS: usize = 8;

    /// Idle pooled connections kept per tablet server
    pub const MAX_IDLE_CLIENTS: usize = 2;

    /// Coordination root of the store instance
    pub const INSTANCE_ROOT: &str = "/walgc/instance";

    /// Coordination subtree holding tablet server locks
    pub const TSERVERS_NODE: &str = "/tservers";
}

/// What to conclude when the coordination service cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownLivenessPolicy {
    /// Treat the server as alive; its files wait for a later cycle
    #[default]
    AssumeAlive,
    /// Treat the server as gone; its files are deleted directly
    AssumeDead,
}

/// Garbage collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// WAL roots; the first is used to resolve relative metadata references
    pub wal_dirs: Vec<PathBuf>,
    /// Sorted recovery log roots
    pub recovery_dirs: Vec<PathBuf>,
    /// Move files to trash instead of deleting them
    pub use_trash: bool,
    /// Trash location for the local volume
    pub trash_dir: Option<PathBuf>,
    /// Coordination root of the store instance
    pub instance_root: String,
    pub cycle_interval_secs: u64,
    pub initial_delay_secs: u64,
    pub rpc_timeout_ms: u64,
    pub max_concurrent_rpcs: usize,
    pub max_idle_clients: usize,
    pub unknown_liveness: UnknownLivenessPolicy,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            wal_dirs: vec![PathBuf::from("data/wal")],
            recovery_dirs: vec![PathBuf::from("data/recovery")],
            use_trash: false,
            trash_dir: None,
            instance_root: defaults::INSTANCE_ROOT.to_string(),
            cycle_interval_secs: defaults::CYCLE_INTERVAL_SECS,
            initial_delay_secs: defaults::INITIAL_DELAY_SECS,
            rpc_timeout_ms: defaults::RPC_TIMEOUT_MS,
            max_concurrent_rpcs: defaults::MAX_CONCURRENT_RPCS,
            max_idle_clients: defaults::MAX_IDLE_CLIENTS,
            unknown_liveness: UnknownLivenessPolicy::default(),
        }
    }
}

impl GcConfig {
    /// Reject configurations the collector cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.wal_dirs.is_empty() {
            return Err(GcError::Config("at least one WAL directory is required".into()));
        }
        if self.max_concurrent_rpcs == 0 {
            return Err(GcError::Config("max_concurrent_rpcs must be positive".into()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(GcError::Config("rpc_timeout_ms must be positive".into()));
        }
        if self.use_trash && self.trash_dir.is_none() {
            return Err(GcError::Config("use_trash requires trash_dir".into()));
        }
        Ok(())
    }

    /// Root that relative metadata references are resolved against
    pub fn primary_wal_dir(&self) -> Result<&Path> {
        self.wal_dirs
            .first()
            .map(PathBuf::as_path)
            .ok_or_else(|| GcError::Config("no WAL directory configured".into()))
    }

    /// Coordination path under which tablet servers register their locks
    pub fn tservers_path(&self) -> String {
        format!(
            "{}{}",
            self.instance_root.trim_end_matches('/'),
            defaults::TSERVERS_NODE
        )
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Locations of the file-backed collaborators used by the bundled binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackends {
    /// JSON-lines export of the metadata table's log entries
    pub metadata_file: PathBuf,
    /// Directory mirroring the coordination service namespace
    pub coordination_dir: PathBuf,
}

impl Default for LocalBackends {
    fn default() -> Self {
        Self {
            metadata_file: PathBuf::from("data/metadata/logs.jsonl"),
            coordination_dir: PathBuf::from("data/coordination"),
        }
    }
}

/// Everything a deployment of the collector needs, as loaded from disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub gc: GcConfig,
    pub backends: LocalBackends,
    pub credentials: Credentials,
}

impl DeploymentConfig {
    /// Load from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| GcError::Config(format!("{}: {}", path.display(), e)))?;
        config.gc.validate()?;
        Ok(config)
    }
}
