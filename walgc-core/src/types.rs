//! Core types for the WAL garbage collector

use crate::{GcError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Check whether a file name is a WAL identifier
pub fn is_uuid(name: &str) -> bool {
    Uuid::parse_str(name).is_ok()
}

/// Final path component as a string, if it is valid UTF-8
pub fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Address of a tablet server (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId {
    host: String,
    port: u16,
}

impl ServerId {
    /// Create a server id from its parts
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, or the directory-safe `host+port` form
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .or_else(|| s.rsplit_once('+'))
            .ok_or_else(|| GcError::InvalidAddress(s.to_string()))?;

        if host.is_empty() {
            return Err(GcError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| GcError::InvalidAddress(s.to_string()))?;

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerId {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A WAL file discovered on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFile {
    /// UUID file name, the identity used for cross-referencing
    pub name: String,
    /// Full storage path
    pub path: PathBuf,
    /// Name of the owning server directory; `None` for legacy flat WALs
    pub owner: Option<String>,
}

impl WalFile {
    /// Old-style WALs live directly under the WAL root
    pub fn is_legacy(&self) -> bool {
        self.owner.is_none()
    }
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    #[default]
    Running,
    Completed,
    Failed,
}

/// Wall-clock time spent in each phase, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub scan_ms: u64,
    pub metadata_ms: u64,
    pub remove_ms: u64,
}

/// Statistics for a single collection cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcCycleStats {
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// WAL files found on disk
    pub candidates: u64,
    /// Candidates still referenced by a tablet
    pub in_use: u64,
    /// WAL files removed, directly or acknowledged by their server
    pub deleted: u64,
    /// Sorted recovery logs removed
    pub recovery_deleted: u64,
    /// Deletions or RPCs that failed and will be retried
    pub errors: u64,
    pub outcome: CycleOutcome,
    pub phases: PhaseTimings,
}

impl GcCycleStats {
    /// Fresh stats for a cycle starting now
    pub fn started_now() -> Self {
        Self {
            started: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// Collector status exposed for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStatus {
    /// The cycle in progress, or the most recent failed one
    pub current: GcCycleStats,
    /// The most recently completed cycle
    pub last: Option<GcCycleStats>,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
}
