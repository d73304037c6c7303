//! Deletion of obsolete files

use super::VolumeManager;
use std::path::Path;
use std::sync::Arc;
use tracing::error;

/// Result of removing a single path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Moved to trash or deleted
    Deleted,
    /// Someone else removed it first
    AlreadyAbsent,
    /// Left in place for the next cycle
    Failed(String),
}

impl RemoveOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, RemoveOutcome::Deleted)
    }
}

/// Removes files through a [`VolumeManager`], preferring trash when enabled
#[derive(Clone)]
pub struct DeletionExecutor {
    volume: Arc<dyn VolumeManager>,
    use_trash: bool,
}

impl DeletionExecutor {
    /// Create a new executor
    pub fn new(volume: Arc<dyn VolumeManager>, use_trash: bool) -> Self {
        Self { volume, use_trash }
    }

    /// Remove a WAL file.
    ///
    /// Never fails the caller: a missing file is `AlreadyAbsent`, any other
    /// error is logged and returned as `Failed`.
    pub fn remove(&self, path: &Path) -> RemoveOutcome {
        let outcome = self.try_remove(path);
        if let RemoveOutcome::Failed(reason) = &outcome {
            error!("Unable to delete wal {:?}: {}", path, reason);
        }
        outcome
    }

    /// Remove a sorted recovery log.
    ///
    /// A failed delete is only reported when the file is still there.
    pub fn remove_recovery_log(&self, path: &Path) -> RemoveOutcome {
        match self.try_remove(path) {
            RemoveOutcome::Failed(reason) => match self.volume.exists(path) {
                Ok(true) => {
                    error!("Unable to delete sorted walog {:?}: {}", path, reason);
                    RemoveOutcome::Failed(reason)
                }
                Ok(false) => RemoveOutcome::AlreadyAbsent,
                Err(e) => {
                    error!("Unable to check for the existence of {:?}: {}", path, e);
                    RemoveOutcome::Failed(reason)
                }
            },
            outcome => outcome,
        }
    }

    fn try_remove(&self, path: &Path) -> RemoveOutcome {
        if self.use_trash {
            match self.volume.move_to_trash(path) {
                Ok(true) => return RemoveOutcome::Deleted,
                Ok(false) => {}
                Err(e) if e.is_not_found() => return RemoveOutcome::AlreadyAbsent,
                Err(e) => return RemoveOutcome::Failed(e.to_string()),
            }
        }

        match self.volume.delete_recursively(path) {
            Ok(()) => RemoveOutcome::Deleted,
            Err(e) if e.is_not_found() => RemoveOutcome::AlreadyAbsent,
            Err(e) => RemoveOutcome::Failed(e.to_string()),
        }
    }
}
