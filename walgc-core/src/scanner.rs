//! Discovery of candidate WAL and recovery log files
//!
//! Layout on the volume:
//!
//! ```text
//! <walRoot>/<server>/<uuid>     current-generation WALs
//! <walRoot>/<uuid>              legacy WALs with no known owner
//! <recoveryRoot>/<uuid>         sorted recovery logs
//! ```

use crate::fs::{FileStatus, VolumeManager};
use crate::types::{file_name, is_uuid};
use crate::{ServerId, WalFile};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// WAL files found on disk, indexed by path and by name
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    by_path: HashMap<PathBuf, Option<String>>,
    by_name: HashMap<String, PathBuf>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candidate
    pub fn insert(&mut self, file: WalFile) {
        self.by_name.insert(file.name, file.path.clone());
        self.by_path.insert(file.path, file.owner);
    }

    /// Drop a name from consideration; returns true if it was a candidate
    pub fn remove_name(&mut self, name: &str) -> bool {
        self.by_name.remove(name).is_some()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Number of files discovered
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Group the files whose names are still candidates by owning server
    pub fn group_by_server(self) -> ServerGroups {
        let mut groups = ServerGroups::default();
        for (path, owner) in self.by_path {
            let Some(name) = file_name(&path) else {
                continue;
            };
            if !self.by_name.contains_key(name) {
                continue;
            }
            let Some(owner) = owner else {
                groups.legacy.push(path);
                continue;
            };
            // `host:port` and `host+port` directories belong to the same server
            match ServerId::parse(&owner) {
                Ok(server) => groups.servers.entry(server).or_default().push(path),
                Err(_) => groups.unrecognized.entry(owner).or_default().push(path),
            }
        }

        groups.legacy.sort();
        for paths in groups
            .servers
            .values_mut()
            .chain(groups.unrecognized.values_mut())
        {
            paths.sort();
        }
        groups
    }
}

/// Remaining candidates grouped by owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerGroups {
    /// Old-style WALs, removed directly
    pub legacy: Vec<PathBuf>,
    /// Files per owning server
    pub servers: BTreeMap<ServerId, Vec<PathBuf>>,
    /// Files under directories that do not name a server, never removed
    pub unrecognized: BTreeMap<String, Vec<PathBuf>>,
}

impl ServerGroups {
    /// Number of files across all groups
    pub fn file_count(&self) -> usize {
        self.legacy.len()
            + self
                .servers
                .values()
                .chain(self.unrecognized.values())
                .map(Vec::len)
                .sum::<usize>()
    }
}

/// Sorted recovery logs by name
pub type RecoverySet = BTreeMap<String, PathBuf>;

/// Output of a WAL scan
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub candidates: CandidateSet,
    /// Distinct top-level entry names seen, for throughput reporting
    pub servers: HashSet<String>,
}

/// Walks the WAL and recovery directories
#[derive(Clone)]
pub struct WalScanner {
    volume: Arc<dyn VolumeManager>,
    wal_dirs: Vec<PathBuf>,
    recovery_dirs: Vec<PathBuf>,
}

impl WalScanner {
    /// Create a new scanner
    pub fn new(
        volume: Arc<dyn VolumeManager>,
        wal_dirs: Vec<PathBuf>,
        recovery_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            volume,
            wal_dirs,
            recovery_dirs,
        }
    }

    /// Collect every UUID-named WAL under the configured roots
    pub fn scan(&self) -> ScanResult {
        let mut result = ScanResult::default();

        for wal_root in &self.wal_dirs {
            let Some(listing) = self.list(wal_root) else {
                continue;
            };

            for status in listing {
                let Some(name) = status.name().map(str::to_string) else {
                    continue;
                };
                result.servers.insert(name.clone());

                if status.is_dir {
                    self.scan_server_dir(&status.path, &name, &mut result.candidates);
                } else if is_uuid(&name) {
                    result.candidates.insert(WalFile {
                        name,
                        path: status.path,
                        owner: None,
                    });
                } else {
                    info!(
                        "Ignoring file {:?} because it doesn't look like a uuid",
                        status.path
                    );
                }
            }
        }

        result
    }

    /// Collect every UUID-named sorted log under the recovery roots
    pub fn scan_recovery(&self) -> RecoverySet {
        let mut result = RecoverySet::new();

        for recovery_root in &self.recovery_dirs {
            let Some(listing) = self.list(recovery_root) else {
                continue;
            };

            for status in listing {
                match status.name() {
                    Some(name) if is_uuid(name) => {
                        result.insert(name.to_string(), status.path);
                    }
                    _ => debug!(
                        "Ignoring file {:?} because it doesn't look like a uuid",
                        status.path
                    ),
                }
            }
        }

        result
    }

    fn scan_server_dir(&self, dir: &Path, server: &str, candidates: &mut CandidateSet) {
        let Some(listing) = self.list(dir) else {
            return;
        };

        for file in listing {
            match file.name() {
                Some(name) if is_uuid(name) => candidates.insert(WalFile {
                    name: name.to_string(),
                    path: file.path,
                    owner: Some(server.to_string()),
                }),
                _ => info!(
                    "Ignoring file {:?} because it doesn't look like a uuid",
                    file.path
                ),
            }
        }
    }

    /// List a directory; a missing or unreadable one yields nothing
    fn list(&self, dir: &Path) -> Option<Vec<FileStatus>> {
        match self.volume.list_status(dir) {
            Ok(listing) => Some(listing),
            Err(e) if e.is_not_found() => {
                debug!("Directory {:?} does not exist", dir);
                None
            }
            Err(e) => {
                warn!("Unable to list {:?}: {}", dir, e);
                None
            }
        }
    }
}
