//! Tablet server liveness, as seen by the coordination service
//!
//! A tablet server holds its operating lock by keeping an ephemeral child
//! node under `<instance_root>/tservers/<host:port>`. The node vanishes when
//! the server's session ends, so "has at least one child" means the server
//! may still be writing to its WALs.

use crate::config::UnknownLivenessPolicy;
use crate::error::CoordinationError;
use crate::ServerId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Read-only view of the coordination service
pub trait Coordinator: Send + Sync {
    /// List the children of a node
    fn get_children(&self, path: &str) -> std::result::Result<Vec<String>, CoordinationError>;
}

/// Answers whether a tablet server currently holds its lock
#[derive(Clone)]
pub struct LivenessOracle {
    coordinator: Arc<dyn Coordinator>,
    tservers_path: String,
    unknown: UnknownLivenessPolicy,
}

impl LivenessOracle {
    /// Create a new oracle rooted at the tablet server lock path
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        tservers_path: impl Into<String>,
        unknown: UnknownLivenessPolicy,
    ) -> Self {
        Self {
            coordinator,
            tservers_path: tservers_path.into(),
            unknown,
        }
    }

    /// Lock path of a single server
    pub fn lock_path(&self, server: &ServerId) -> String {
        format!("{}/{}", self.tservers_path, server)
    }

    /// Check whether `server` holds a live registration
    pub fn is_alive(&self, server: &ServerId) -> bool {
        let path = self.lock_path(server);
        match self.coordinator.get_children(&path) {
            Ok(children) => !children.is_empty(),
            Err(CoordinationError::NoNode(_)) => false,
            Err(e) => {
                debug!("Liveness of {} unknown: {}", server, e);
                self.unknown == UnknownLivenessPolicy::AssumeAlive
            }
        }
    }
}

/// In-memory coordinator
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    nodes: RwLock<BTreeMap<String, Vec<String>>>,
    unavailable: RwLock<BTreeMap<String, String>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an ephemeral child under `path`, creating the node if needed
    pub fn register(&self, path: &str, child: &str) {
        self.nodes
            .write()
            .entry(path.to_string())
            .or_default()
            .push(child.to_string());
    }

    /// Create `path` with no children
    pub fn create(&self, path: &str) {
        self.nodes.write().entry(path.to_string()).or_default();
    }

    /// Delete a node and its children
    pub fn delete(&self, path: &str) {
        self.nodes.write().remove(path);
    }

    /// Make lookups of `path` fail with [`CoordinationError::Unavailable`]
    pub fn fail(&self, path: &str, reason: &str) {
        self.unavailable
            .write()
            .insert(path.to_string(), reason.to_string());
    }
}

impl Coordinator for MemoryCoordinator {
    fn get_children(&self, path: &str) -> std::result::Result<Vec<String>, CoordinationError> {
        if let Some(reason) = self.unavailable.read().get(path) {
            return Err(CoordinationError::Unavailable(reason.clone()));
        }
        self.nodes
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }
}

/// Coordinator whose namespace is mirrored as a directory tree.
///
/// Node `/a/b` is the directory `<root>/a/b`; its children are the
/// directory's entries. Lookups are blocking `std::fs` reads on the calling
/// thread, so the tree should live on a local disk.
#[derive(Debug, Clone)]
pub struct DirCoordinator {
    root: PathBuf,
}

impl DirCoordinator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn node_dir(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Coordinator for DirCoordinator {
    fn get_children(&self, path: &str) -> std::result::Result<Vec<String>, CoordinationError> {
        let dir = self.node_dir(path);
        let entries = std::fs::read_dir(&dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoordinationError::NoNode(path.to_string()),
            _ => CoordinationError::Unavailable(format!("{}: {}", dir.display(), e)),
        })?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| CoordinationError::Unavailable(format!("{}: {}", dir.display(), e)))?;
            children.push(entry.file_name().to_string_lossy().into_owned());
        }
        children.sort();
        Ok(children)
    }
}
