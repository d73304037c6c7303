//! Removal of unreferenced WALs, per owning server
//!
//! A file whose server still holds its lock may still be open for writing,
//! so only that server is allowed to remove it: the collector sends one
//! batched `remove_logs` call per live server. Files of servers without a
//! lock, legacy files with no owner and sorted recovery logs are deleted
//! directly.

use crate::fs::{DeletionExecutor, RemoveOutcome};
use crate::liveness::LivenessOracle;
use crate::rpc::{ClientPool, Credentials, TraceInfo};
use crate::scanner::{RecoverySet, ServerGroups};
use crate::{GcCycleStats, GcError, Result, ServerId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// What a dispatch pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Server groups processed, legacy files excluded
    pub servers: usize,
    /// Servers asked to remove their own logs
    pub remote_servers: usize,
    /// WAL files deleted directly or acknowledged remotely
    pub deleted: u64,
    /// WAL files kept for the next cycle
    pub deferred: u64,
    pub recovery_deleted: u64,
}

/// Routes each remaining candidate to direct deletion or to its server
pub struct Dispatcher {
    executor: DeletionExecutor,
    liveness: LivenessOracle,
    pool: Arc<ClientPool>,
    max_concurrent: usize,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        executor: DeletionExecutor,
        liveness: LivenessOracle,
        pool: Arc<ClientPool>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            executor,
            liveness,
            pool,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Remove every file in `groups`, then every surviving recovery log
    pub async fn dispatch(
        &self,
        groups: ServerGroups,
        recovery: RecoverySet,
        credentials: &Credentials,
        trace: TraceInfo,
        stats: &mut GcCycleStats,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary {
            servers: groups.servers.len() + groups.unrecognized.len(),
            ..Default::default()
        };

        for path in &groups.legacy {
            debug!("Removing old-style WAL {:?}", path);
            self.remove_direct(path, stats, &mut summary);
        }

        for (dir, paths) in &groups.unrecognized {
            warn!(
                "Keeping {} WALs under {:?}, not a server address",
                paths.len(),
                dir
            );
            summary.deferred += paths.len() as u64;
        }

        let mut live = Vec::new();
        for (server, paths) in groups.servers {
            if self.liveness.is_alive(&server) {
                live.push((server, paths));
            } else {
                for path in &paths {
                    debug!("Removing WAL for offline server {:?}", path);
                    self.remove_direct(path, stats, &mut summary);
                }
            }
        }

        summary.remote_servers = live.len();
        self.remove_remote(live, credentials, trace, stats, &mut summary)
            .await;

        for path in recovery.values() {
            debug!("Removing sorted WAL {:?}", path);
            if self.executor.remove_recovery_log(path).is_deleted() {
                stats.recovery_deleted += 1;
                summary.recovery_deleted += 1;
            }
        }

        summary
    }

    fn remove_direct(
        &self,
        path: &Path,
        stats: &mut GcCycleStats,
        summary: &mut DispatchSummary,
    ) {
        match self.executor.remove(path) {
            RemoveOutcome::Deleted => {
                stats.deleted += 1;
                summary.deleted += 1;
            }
            RemoveOutcome::AlreadyAbsent => {}
            RemoveOutcome::Failed(_) => {
                stats.errors += 1;
                summary.deferred += 1;
            }
        }
    }

    async fn remove_remote(
        &self,
        live: Vec<(ServerId, Vec<PathBuf>)>,
        credentials: &Credentials,
        trace: TraceInfo,
        stats: &mut GcCycleStats,
        summary: &mut DispatchSummary,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        // Files per server whose task has not reported back
        let mut pending: HashMap<ServerId, u64> = HashMap::new();

        for (server, paths) in live {
            let pool = Arc::clone(&self.pool);
            let semaphore = Arc::clone(&semaphore);
            let credentials = credentials.clone();
            let trace = trace.child();
            let logs: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            pending.insert(server.clone(), logs.len() as u64);

            tasks.spawn(async move {
                let count = logs.len() as u64;
                let result =
                    send_remove_logs(&pool, &semaphore, &server, trace, &credentials, logs.clone())
                        .await;
                (server, logs, count, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((server, logs, count, Ok(()))) => {
                    debug!("deleted {:?} from {}", logs, server);
                    pending.remove(&server);
                    stats.deleted += count;
                    summary.deleted += count;
                }
                Ok((server, _, count, Err(e))) => {
                    warn!("Error talking to {}: {}", server, e);
                    pending.remove(&server);
                    stats.errors += 1;
                    summary.deferred += count;
                }
                Err(e) => {
                    error!("remove_logs task did not complete: {}", e);
                    stats.errors += 1;
                }
            }
        }

        // Left over only by tasks that panicked or were cancelled
        summary.deferred += pending.values().sum::<u64>();
    }
}

async fn send_remove_logs(
    pool: &Arc<ClientPool>,
    semaphore: &Semaphore,
    server: &ServerId,
    trace: TraceInfo,
    credentials: &Credentials,
    logs: Vec<String>,
) -> Result<()> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|e| GcError::Internal(e.to_string()))?;
    let mut client = pool.checkout(server).await?;
    client.remove_logs(trace, credentials, logs).await
}
