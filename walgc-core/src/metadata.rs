//! Cross-referencing candidates against the metadata table
//!
//! The metadata table is the only authority on which WALs tablets still
//! need. Every log entry is read in a single pass; any error while reading
//! fails the cycle, since a reference we never saw could make the collector
//! delete a file that is still needed for recovery.

use crate::rpc::Credentials;
use crate::scanner::{CandidateSet, RecoverySet};
use crate::types::file_name;
use crate::{GcCycleStats, GcError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One tablet's log column from the metadata table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Tablet the entry belongs to
    pub extent: String,
    /// Server that wrote the log
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub filename: String,
    /// References of the form `<tabletInfo>/<filename-or-path>`
    pub log_set: Vec<String>,
}

/// A WAL a tablet depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogReference {
    /// Resolved location of the WAL
    pub path: PathBuf,
    /// WAL name matched against candidates
    pub name: String,
}

impl LogReference {
    /// Resolve one `log_set` element.
    ///
    /// The part after the first `/` is either a fully qualified location
    /// (contains `:`) or a path relative to `wal_root`.
    pub fn parse(reference: &str, wal_root: &Path) -> Result<Self> {
        let (_, filename) = reference
            .split_once('/')
            .ok_or_else(|| GcError::Metadata(format!("malformed log reference {:?}", reference)))?;

        let path = if filename.contains(':') {
            PathBuf::from(filename)
        } else {
            wal_root.join(filename)
        };

        let name = file_name(&path)
            .ok_or_else(|| {
                GcError::Metadata(format!("log reference {:?} has no file name", reference))
            })?
            .to_string();

        Ok(Self { path, name })
    }
}

/// Lazy stream of log entries
pub type LogEntries<'a> = Box<dyn Iterator<Item = Result<LogEntry>> + Send + 'a>;

/// Source of metadata log entries
pub trait MetadataSource: Send + Sync {
    /// Start a full scan of the log column
    fn log_entries(&self, credentials: &Credentials) -> Result<LogEntries<'_>>;
}

/// Metadata held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadata {
    entries: Vec<LogEntry>,
    fail_after: Option<usize>,
}

impl MemoryMetadata {
    pub fn new(entries: Vec<LogEntry>) -> Self {
        Self {
            entries,
            fail_after: None,
        }
    }

    /// Make the scan fail once `n` entries have been returned
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl MetadataSource for MemoryMetadata {
    fn log_entries(&self, _credentials: &Credentials) -> Result<LogEntries<'_>> {
        let fail_after = self.fail_after;
        let entries = self.entries.iter().cloned().map(Ok::<LogEntry, GcError>);
        match fail_after {
            None => Ok(Box::new(entries)),
            Some(n) => Ok(Box::new(entries.take(n).chain(std::iter::once(Err(
                GcError::Metadata(format!("scan interrupted after {} entries", n)),
            ))))),
        }
    }
}

/// Metadata exported as one JSON [`LogEntry`] per line
#[derive(Debug, Clone)]
pub struct JsonLinesMetadata {
    path: PathBuf,
}

impl JsonLinesMetadata {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetadataSource for JsonLinesMetadata {
    fn log_entries(&self, _credentials: &Credentials) -> Result<LogEntries<'_>> {
        let file = File::open(&self.path)
            .map_err(|e| GcError::Metadata(format!("{}: {}", self.path.display(), e)))?;
        let path = self.path.clone();

        let entries = BufReader::new(file)
            .lines()
            .enumerate()
            .filter(|(_, line)| !matches!(line, Ok(l) if l.trim().is_empty()))
            .map(move |(index, line)| {
                let line = line
                    .map_err(|e| GcError::Metadata(format!("{}: {}", path.display(), e)))?;
                serde_json::from_str(&line).map_err(|e| {
                    GcError::Metadata(format!("{}:{}: {}", path.display(), index + 1, e))
                })
            });
        Ok(Box::new(entries))
    }
}

/// Candidates left after removing everything still referenced
#[derive(Debug, Clone, Default)]
pub struct CrossReference {
    pub candidates: CandidateSet,
    pub recovery: RecoverySet,
    /// Log references read from the metadata table
    pub references: u64,
}

/// Remove every referenced WAL from the candidate sets.
///
/// Each name found in either set counts once towards `stats.in_use`. On
/// error the counter keeps whatever was counted so far and the caller must
/// not delete anything.
pub fn filter_in_use(
    mut candidates: CandidateSet,
    mut recovery: RecoverySet,
    source: &dyn MetadataSource,
    wal_root: &Path,
    credentials: &Credentials,
    stats: &mut GcCycleStats,
) -> Result<CrossReference> {
    let mut references = 0u64;

    for entry in source.log_entries(credentials)? {
        let entry = entry?;
        for reference in &entry.log_set {
            let reference = LogReference::parse(reference, wal_root)?;

            let wal_in_use = candidates.remove_name(&reference.name);
            let sorted_in_use = recovery.remove(&reference.name).is_some();
            if wal_in_use || sorted_in_use {
                debug!("{} is still in use by {}", reference.name, entry.extent);
                stats.in_use += 1;
            }
            references += 1;
        }
    }

    Ok(CrossReference {
        candidates,
        recovery,
        references,
    })
}
