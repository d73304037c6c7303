//! Write-ahead log garbage collection cycle
//!
//! One cycle runs the phases strictly in order:
//!
//! 1. scan the recovery and WAL directories for candidates
//! 2. cross-reference candidates with the metadata table
//! 3. remove what is left, directly or through the owning server
//! 4. roll the cycle's stats into the status record
//!
//! A failure in phase 2 ends the cycle before anything is removed.

use crate::config::{GcConfig, LocalBackends};
use crate::dispatch::Dispatcher;
use crate::fs::{DeletionExecutor, LocalVolume, VolumeManager};
use crate::liveness::{Coordinator, DirCoordinator, LivenessOracle};
use crate::metadata::{filter_in_use, JsonLinesMetadata, MetadataSource};
use crate::rpc::{ClientPool, Credentials, TabletClientFactory, TcpClientFactory, TraceInfo};
use crate::scanner::WalScanner;
use crate::{CycleOutcome, GcCycleStats, GcStatus, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, Instrument};

/// Per-deployment context handed to the collector
#[derive(Debug, Clone, Default)]
pub struct GcContext {
    pub credentials: Credentials,
}

impl GcContext {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

/// External systems the collector reconciles
#[derive(Clone)]
pub struct Collaborators {
    pub volume: Arc<dyn VolumeManager>,
    pub metadata: Arc<dyn MetadataSource>,
    pub coordinator: Arc<dyn Coordinator>,
    pub clients: Arc<dyn TabletClientFactory>,
}

impl Collaborators {
    /// File-backed collaborators used by the bundled binaries
    pub fn local(config: &GcConfig, backends: &LocalBackends) -> Self {
        let volume: Arc<dyn VolumeManager> = match (&config.trash_dir, config.use_trash) {
            (Some(trash_dir), true) => Arc::new(LocalVolume::with_trash(trash_dir)),
            _ => Arc::new(LocalVolume::new()),
        };

        Self {
            volume,
            metadata: Arc::new(JsonLinesMetadata::new(&backends.metadata_file)),
            coordinator: Arc::new(DirCoordinator::new(&backends.coordination_dir)),
            clients: Arc::new(TcpClientFactory),
        }
    }
}

/// Result of a call to [`GarbageCollector::collect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome {
    Completed(GcCycleStats),
    Failed(GcCycleStats),
    /// Another cycle was still running
    Skipped,
}

/// Collects obsolete write-ahead logs
pub struct GarbageCollector {
    cycle_runner: Arc<CycleRunner>,
    status: Arc<RwLock<GcStatus>>,
    cycle: tokio::sync::Mutex<()>,
}

/// The phases of one cycle, shared with the task that runs them
struct CycleRunner {
    config: GcConfig,
    context: GcContext,
    scanner: WalScanner,
    metadata: Arc<dyn MetadataSource>,
    dispatcher: Dispatcher,
    status: Arc<RwLock<GcStatus>>,
}

impl GarbageCollector {
    /// Create a new collector
    pub fn new(config: GcConfig, context: GcContext, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let scanner = WalScanner::new(
            Arc::clone(&collaborators.volume),
            config.wal_dirs.clone(),
            config.recovery_dirs.clone(),
        );
        let executor = DeletionExecutor::new(collaborators.volume, config.use_trash);
        let liveness = LivenessOracle::new(
            collaborators.coordinator,
            config.tservers_path(),
            config.unknown_liveness,
        );
        let pool = Arc::new(ClientPool::new(
            collaborators.clients,
            config.rpc_timeout(),
            config.max_idle_clients,
        ));
        let dispatcher = Dispatcher::new(executor, liveness, pool, config.max_concurrent_rpcs);
        let status = Arc::new(RwLock::new(GcStatus::default()));

        Ok(Self {
            cycle_runner: Arc::new(CycleRunner {
                config,
                context,
                scanner,
                metadata: collaborators.metadata,
                dispatcher,
                status: Arc::clone(&status),
            }),
            status,
            cycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &GcConfig {
        &self.cycle_runner.config
    }

    /// Snapshot of the status record
    pub fn status(&self) -> GcStatus {
        self.status.read().clone()
    }

    /// Run one cycle unless one is already in progress.
    ///
    /// The cycle runs on its own task, so a panic in any phase ends that
    /// cycle as failed instead of taking the caller down with it.
    pub async fn collect(&self) -> CollectOutcome {
        let Ok(_running) = self.cycle.try_lock() else {
            info!("Previous write-ahead log collection still running, skipping");
            return CollectOutcome::Skipped;
        };

        let stats = GcCycleStats::started_now();
        self.cycle_runner.publish(&stats);

        let runner = Arc::clone(&self.cycle_runner);
        let cycle = tokio::spawn(async move {
            let mut stats = stats;
            let result = runner.run_cycle(&mut stats).await;
            (stats, result)
        });

        let (mut stats, result) = match cycle.await {
            Ok((stats, result)) => (stats, result.map_err(|e| e.to_string())),
            // Partial stats are whatever the last finished phase published
            Err(e) => (self.status.read().current.clone(), Err(e.to_string())),
        };
        stats.finished = Some(Utc::now());

        match result {
            Ok(()) => {
                stats.outcome = CycleOutcome::Completed;

                let mut status = self.status.write();
                status.last = Some(stats.clone());
                status.current = GcCycleStats::default();
                status.cycles_completed += 1;
                CollectOutcome::Completed(stats)
            }
            Err(e) => {
                error!("Write-ahead log collection aborted: {}", e);
                stats.outcome = CycleOutcome::Failed;

                let mut status = self.status.write();
                status.current = stats.clone();
                status.cycles_failed += 1;
                CollectOutcome::Failed(stats)
            }
        }
    }

    /// Run cycles on the configured interval until `shutdown` resolves
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        let config = self.config();
        let start = tokio::time::Instant::now() + config.initial_delay();
        let mut ticker = tokio::time::interval_at(start, config.cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Collecting write-ahead logs every {:?} after {:?}",
            config.cycle_interval(),
            config.initial_delay()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Write-ahead log collector stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.collect().await;
                }
            }
        }
    }
}

impl CycleRunner {
    async fn run_cycle(&self, stats: &mut GcCycleStats) -> Result<()> {
        let trace = TraceInfo::root();

        let (recovery, scan) = {
            let _span = info_span!("scan_servers", trace_id = trace.trace_id).entered();
            let scan_start = Instant::now();

            let recovery = self.scanner.scan_recovery();
            let scan = self.scanner.scan();
            stats.candidates = scan.candidates.len() as u64;
            stats.phases.scan_ms = elapsed_ms(scan_start);
            self.publish(stats);
            info!(
                "Fetched {} files from {} servers in {:.2} seconds",
                scan.candidates.len(),
                scan.servers.len(),
                scan_start.elapsed().as_secs_f64()
            );
            (recovery, scan)
        };

        let filtered = {
            let _span =
                info_span!("remove_metadata_entries", trace_id = trace.trace_id).entered();
            let metadata_start = Instant::now();

            let filtered = filter_in_use(
                scan.candidates,
                recovery,
                self.metadata.as_ref(),
                self.config.primary_wal_dir()?,
                &self.context.credentials,
                stats,
            );
            stats.phases.metadata_ms = elapsed_ms(metadata_start);
            self.publish(stats);
            let filtered = filtered.map_err(|e| {
                error!("Unable to scan metadata table: {}", e);
                e
            })?;
            info!(
                "{} log entries scanned in {:.2} seconds",
                filtered.references,
                metadata_start.elapsed().as_secs_f64()
            );
            filtered
        };

        let remove_start = Instant::now();
        let groups = filtered.candidates.group_by_server();
        let summary = self
            .dispatcher
            .dispatch(
                groups,
                filtered.recovery,
                &self.context.credentials,
                trace,
                stats,
            )
            .instrument(info_span!("remove_files", trace_id = trace.trace_id))
            .await;
        stats.phases.remove_ms = elapsed_ms(remove_start);
        info!(
            "{} total logs removed from {} servers in {:.2} seconds \
             ({} deferred, {} sorted logs removed)",
            summary.deleted,
            summary.servers,
            remove_start.elapsed().as_secs_f64(),
            summary.deferred,
            summary.recovery_deleted
        );

        Ok(())
    }

    fn publish(&self, stats: &GcCycleStats) {
        self.status.write().current = stats.clone();
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::MemoryCoordinator;
    use crate::metadata::{LogEntries, LogEntry, MemoryMetadata};
    use crate::testing::{RecordingFactory, UUID_1, UUID_2, UUID_3, UUID_4, UUID_5};
    use crate::ServerId;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tracing::span::{Attributes, Id};
    use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};

    const TSERVERS: &str = "/walgc/instance/tservers";

    struct Cluster {
        temp_dir: TempDir,
        coordinator: Arc<MemoryCoordinator>,
        factory: RecordingFactory,
    }

    impl Cluster {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            fs::create_dir_all(temp_dir.path().join("wal")).unwrap();
            fs::create_dir_all(temp_dir.path().join("recovery")).unwrap();
            Self {
                temp_dir,
                coordinator: Arc::new(MemoryCoordinator::new()),
                factory: RecordingFactory::new(),
            }
        }

        fn wal_root(&self) -> PathBuf {
            self.temp_dir.path().join("wal")
        }

        fn recovery_root(&self) -> PathBuf {
            self.temp_dir.path().join("recovery")
        }

        fn server_wal(&self, server: &str, name: &str) -> PathBuf {
            let dir = self.wal_root().join(server);
            fs::create_dir_all(&dir).unwrap();
            touch(&dir.join(name))
        }

        fn legacy_wal(&self, name: &str) -> PathBuf {
            touch(&self.wal_root().join(name))
        }

        fn recovery_log(&self, name: &str) -> PathBuf {
            let dir = self.recovery_root().join(name);
            fs::create_dir_all(&dir).unwrap();
            touch(&dir.join("part-r-00000"));
            dir
        }

        fn hold_lock(&self, server: &str) {
            self.coordinator
                .register(&format!("{}/{}", TSERVERS, server), "zlock-0000000001");
        }

        fn collector(&self, metadata: MemoryMetadata) -> GarbageCollector {
            self.collector_with(Arc::new(metadata))
        }

        fn collector_with(&self, metadata: Arc<dyn MetadataSource>) -> GarbageCollector {
            let config = GcConfig {
                wal_dirs: vec![self.wal_root()],
                recovery_dirs: vec![self.recovery_root()],
                ..Default::default()
            };
            let collaborators = Collaborators {
                volume: Arc::new(LocalVolume::new()),
                metadata,
                coordinator: self.coordinator.clone(),
                clients: Arc::new(self.factory.clone()),
            };
            GarbageCollector::new(config, GcContext::default(), collaborators).unwrap()
        }
    }

    /// Metadata source whose scan panics
    struct PanickingMetadata;

    impl MetadataSource for PanickingMetadata {
        fn log_entries(&self, _credentials: &Credentials) -> Result<LogEntries<'_>> {
            panic!("metadata scanner crashed");
        }
    }

    fn touch(path: &Path) -> PathBuf {
        fs::write(path, b"").unwrap();
        path.to_path_buf()
    }

    fn references(names: &[&str]) -> MemoryMetadata {
        MemoryMetadata::new(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| LogEntry {
                    extent: format!("{};row{}", i + 1, i),
                    server: String::new(),
                    filename: String::new(),
                    log_set: vec![format!("host:9997/{}", name)],
                })
                .collect(),
        )
    }

    fn completed(outcome: CollectOutcome) -> GcCycleStats {
        match outcome {
            CollectOutcome::Completed(stats) => stats,
            other => panic!("expected a completed cycle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_live_owner_via_rpc_and_legacy_direct() {
        let cluster = Cluster::new();
        cluster.hold_lock("serverA:9997");
        let owned = cluster.server_wal("serverA:9997", UUID_1);
        let legacy = cluster.legacy_wal(UUID_2);

        let collector = cluster.collector(MemoryMetadata::default());
        let stats = completed(collector.collect().await);

        let calls = cluster.factory.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, ServerId::new("serverA", 9997));
        assert_eq!(calls[0].1, vec![owned.display().to_string()]);
        assert!(owned.exists());
        assert!(!legacy.exists());

        assert_eq!(stats.candidates, 2);
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.outcome, CycleOutcome::Completed);
    }

    #[tokio::test]
    async fn test_dead_owner_deleted_directly() {
        let cluster = Cluster::new();
        let orphan = cluster.server_wal("serverB:9997", UUID_3);

        let collector = cluster.collector(MemoryMetadata::default());
        let stats = completed(collector.collect().await);

        assert!(!orphan.exists());
        assert!(cluster.factory.calls().is_empty());
        assert_eq!(stats.deleted, 1);
    }

    #[tokio::test]
    async fn test_referenced_wal_is_kept() {
        let cluster = Cluster::new();
        let referenced = cluster.server_wal("serverB:9997", UUID_4);

        let collector = cluster.collector(references(&[UUID_4]));
        let stats = completed(collector.collect().await);

        assert!(referenced.exists());
        assert!(cluster.factory.calls().is_empty());
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.deleted, 0);
    }

    #[tokio::test]
    async fn test_unreferenced_recovery_log_deleted() {
        let cluster = Cluster::new();
        cluster.hold_lock("serverA:9997");
        let sorted = cluster.recovery_log(UUID_5);
        let kept = cluster.recovery_log(UUID_1);

        let collector = cluster.collector(references(&[UUID_1]));
        let stats = completed(collector.collect().await);

        assert!(!sorted.exists());
        assert!(kept.exists());
        assert_eq!(stats.recovery_deleted, 1);
        assert_eq!(stats.in_use, 1);
    }

    #[tokio::test]
    async fn test_metadata_failure_aborts_before_removing() {
        let cluster = Cluster::new();
        let a = cluster.server_wal("serverB:9997", UUID_1);
        let b = cluster.server_wal("serverB:9997", UUID_2);
        let legacy = cluster.legacy_wal(UUID_3);
        let sorted = cluster.recovery_log(UUID_5);

        let collector = cluster.collector(references(&[UUID_1, UUID_2]).failing_after(1));
        let stats = match collector.collect().await {
            CollectOutcome::Failed(stats) => stats,
            other => panic!("expected a failed cycle, got {:?}", other),
        };

        assert!(a.exists() && b.exists() && legacy.exists() && sorted.exists());
        assert_eq!(stats.candidates, 3);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.outcome, CycleOutcome::Failed);

        let status = collector.status();
        assert_eq!(status.current, stats);
        assert!(status.last.is_none());
        assert_eq!(status.cycles_failed, 1);
    }

    #[tokio::test]
    async fn test_next_cycle_starts_fresh_after_failure() {
        let cluster = Cluster::new();
        cluster.server_wal("serverB:9997", UUID_1);

        let failing = cluster.collector(references(&[UUID_1]).failing_after(0));
        assert!(matches!(failing.collect().await, CollectOutcome::Failed(_)));

        let collector = cluster.collector(references(&[UUID_1]));
        completed(collector.collect().await);
        let stats = completed(collector.collect().await);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.candidates, 1);

        let status = collector.status();
        assert_eq!(status.cycles_completed, 2);
        assert_eq!(status.current, GcCycleStats::default());
        assert_eq!(status.last.as_ref(), Some(&stats));
        assert!(stats.started.is_some() && stats.finished.is_some());
    }

    #[tokio::test]
    async fn test_panicking_phase_fails_cycle() {
        let cluster = Cluster::new();
        let orphan = cluster.server_wal("serverB:9997", UUID_1);
        let collector = cluster.collector_with(Arc::new(PanickingMetadata));

        let stats = match collector.collect().await {
            CollectOutcome::Failed(stats) => stats,
            other => panic!("expected a failed cycle, got {:?}", other),
        };
        assert!(orphan.exists());
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.outcome, CycleOutcome::Failed);
        assert!(stats.started.is_some() && stats.finished.is_some());

        let status = collector.status();
        assert_eq!(status.current, stats);
        assert_eq!(status.cycles_failed, 1);
        assert_eq!(status.cycles_completed, 0);

        // The cycle lock was released
        assert!(matches!(collector.collect().await, CollectOutcome::Failed(_)));
        assert_eq!(collector.status().cycles_failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_panicking_cycles() {
        let cluster = Cluster::new();
        let collector = Arc::new(cluster.collector_with(Arc::new(PanickingMetadata)));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(Arc::clone(&collector).run(async move {
            let _ = rx.await;
        }));

        let config = collector.config();
        let elapsed = config.initial_delay() + config.cycle_interval() * 2;
        tokio::time::sleep(elapsed + std::time::Duration::from_secs(1)).await;
        assert!(!handle.is_finished());

        tx.send(()).unwrap();
        handle.await.unwrap();

        let status = collector.status();
        assert_eq!(status.cycles_failed, 3);
        assert_eq!(status.current.outcome, CycleOutcome::Failed);
    }

    /// Records the name of every span opened, with whether it carries a trace id
    struct SpanRecorder(Arc<parking_lot::Mutex<Vec<(String, bool)>>>);

    impl<S: tracing::Subscriber> Layer<S> for SpanRecorder {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: LayerContext<'_, S>) {
            let metadata = attrs.metadata();
            let traced = metadata.fields().field("trace_id").is_some();
            self.0.lock().push((metadata.name().to_string(), traced));
        }
    }

    #[test]
    fn test_phases_run_in_trace_spans() {
        let cluster = Cluster::new();
        cluster.legacy_wal(UUID_2);
        let collector = cluster.collector(MemoryMetadata::default());

        let spans = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(SpanRecorder(Arc::clone(&spans)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        completed(runtime.block_on(collector.collect()));

        let spans = spans.lock().clone();
        for phase in ["scan_servers", "remove_metadata_entries", "remove_files"] {
            assert!(
                spans.contains(&(phase.to_string(), true)),
                "no {} span in {:?}",
                phase,
                spans
            );
        }
    }

    #[tokio::test]
    async fn test_overlapping_collect_is_skipped() {
        let cluster = Cluster::new();
        let collector = cluster.collector(MemoryMetadata::default());

        let _running = collector.cycle.try_lock().unwrap();
        assert_eq!(collector.collect().await, CollectOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_second_cycle_is_idempotent() {
        let cluster = Cluster::new();
        cluster.legacy_wal(UUID_2);

        let collector = cluster.collector(MemoryMetadata::default());
        assert_eq!(completed(collector.collect().await).deleted, 1);

        let stats = completed(collector.collect().await);
        assert_eq!(stats.candidates, 0);
        assert_eq!(stats.deleted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let cluster = Cluster::new();
        cluster.legacy_wal(UUID_2);
        let collector = Arc::new(cluster.collector(MemoryMetadata::default()));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(Arc::clone(&collector).run(async move {
            let _ = rx.await;
        }));

        let delay = collector.config().initial_delay();
        tokio::time::sleep(delay + std::time::Duration::from_secs(1)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(collector.status().cycles_completed, 1);
    }

    #[tokio::test]
    async fn test_local_collaborators() {
        let cluster = Cluster::new();
        let metadata_file = cluster.temp_dir.path().join("logs.jsonl");
        let line = serde_json::to_string(&LogEntry {
            extent: "1<".into(),
            server: "serverC:9997".into(),
            filename: UUID_1.into(),
            log_set: vec![format!("serverC:9997/{}", UUID_1)],
        })
        .unwrap();
        fs::write(&metadata_file, format!("{}\n", line)).unwrap();

        let referenced = cluster.server_wal("serverC:9997", UUID_1);
        let orphan = cluster.server_wal("serverC:9997", UUID_2);

        let config = GcConfig {
            wal_dirs: vec![cluster.wal_root()],
            recovery_dirs: vec![cluster.recovery_root()],
            ..Default::default()
        };
        let backends = LocalBackends {
            metadata_file,
            coordination_dir: cluster.temp_dir.path().join("coordination"),
        };
        let collector = GarbageCollector::new(
            config.clone(),
            GcContext::default(),
            Collaborators::local(&config, &backends),
        )
        .unwrap();

        let stats = completed(collector.collect().await);
        assert!(referenced.exists());
        assert!(!orphan.exists());
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.deleted, 1);
    }
}
