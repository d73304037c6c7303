//! Volume abstraction over the file system holding WAL files
//!
//! The collector only needs to list directories, test for existence, delete
//! and move to trash. [`LocalVolume`] implements this on local disk; a
//! distributed file system plugs in behind the same trait.

mod executor;

pub use executor::{DeletionExecutor, RemoveOutcome};

use crate::types::file_name;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A directory entry returned by [`VolumeManager::list_status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub path: PathBuf,
    pub is_dir: bool,
}

impl FileStatus {
    /// Final path component
    pub fn name(&self) -> Option<&str> {
        file_name(&self.path)
    }
}

/// File system operations used by the collector
pub trait VolumeManager: Send + Sync {
    /// List the entries of a directory.
    ///
    /// A missing directory is reported as an IO `NotFound` error.
    fn list_status(&self, dir: &Path) -> Result<Vec<FileStatus>>;

    /// Check whether a path exists
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Delete a file, or a directory and everything below it
    fn delete_recursively(&self, path: &Path) -> Result<()>;

    /// Move a path to the trash.
    ///
    /// Returns `Ok(false)` when trash is not available, in which case the
    /// caller falls back to [`VolumeManager::delete_recursively`].
    fn move_to_trash(&self, path: &Path) -> Result<bool>;
}

/// Volume backed by the local file system.
///
/// Every call is a blocking `std::fs` operation run on the calling thread,
/// which keeps it suitable for local disks only.
#[derive(Debug, Clone, Default)]
pub struct LocalVolume {
    trash_dir: Option<PathBuf>,
}

impl LocalVolume {
    /// Volume without trash support
    pub fn new() -> Self {
        Self { trash_dir: None }
    }

    /// Volume that moves deleted files under `trash_dir`
    pub fn with_trash(trash_dir: impl Into<PathBuf>) -> Self {
        Self {
            trash_dir: Some(trash_dir.into()),
        }
    }

    /// First free name for `path` in the trash: `<name>`, then `<name>.1`, ...
    fn trash_target(trash_dir: &Path, path: &Path) -> PathBuf {
        let name = file_name(path).unwrap_or("unnamed");
        let mut target = trash_dir.join(name);
        let mut suffix = 0u64;
        while target.symlink_metadata().is_ok() {
            suffix += 1;
            target = trash_dir.join(format!("{}.{}", name, suffix));
        }
        target
    }
}

impl VolumeManager for LocalVolume {
    fn list_status(&self, dir: &Path) -> Result<Vec<FileStatus>> {
        let mut listing = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            listing.push(FileStatus {
                path: entry.path(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(listing)
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.try_exists()?)
    }

    fn delete_recursively(&self, path: &Path) -> Result<()> {
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn move_to_trash(&self, path: &Path) -> Result<bool> {
        let Some(trash_dir) = &self.trash_dir else {
            return Ok(false);
        };

        // Surface a missing source as NotFound rather than a trash failure
        fs::symlink_metadata(path)?;
        fs::create_dir_all(trash_dir)?;

        let target = Self::trash_target(trash_dir, path);
        match fs::rename(path, &target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e.into()),
            Err(e) => {
                debug!("Cannot move {:?} to trash {:?}: {}", path, target, e);
                Ok(false)
            }
        }
    }
}
