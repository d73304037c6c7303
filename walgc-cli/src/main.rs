//! walgc CLI - inspect and run write-ahead log collection by hand

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walgc_core::fs::LocalVolume;
use walgc_core::metadata::{filter_in_use, JsonLinesMetadata};
use walgc_core::scanner::WalScanner;
use walgc_core::{
    CollectOutcome, Collaborators, DeploymentConfig, GarbageCollector, GcContext, GcCycleStats,
};

/// Write-ahead log garbage collector tools
#[derive(Debug, Parser)]
#[command(name = "walgc-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON deployment configuration
    #[arg(long, env = "WALGC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List candidate files without removing anything
    Scan {
        /// Leave out files the metadata table still references
        #[arg(long)]
        filter: bool,
    },
    /// Run a single collection cycle
    Collect,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DeploymentConfig::from_file(path)?,
        None => DeploymentConfig::default(),
    };

    match cli.command {
        Commands::Scan { filter } => scan(&config, filter),
        Commands::Collect => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(collect(&config))
        }
        Commands::Config => {
            let mut shown = config.clone();
            if !shown.credentials.token.is_empty() {
                shown.credentials.token = "<redacted>".to_string();
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

fn scan(config: &DeploymentConfig, filter: bool) -> Result<()> {
    let scanner = WalScanner::new(
        Arc::new(LocalVolume::new()),
        config.gc.wal_dirs.clone(),
        config.gc.recovery_dirs.clone(),
    );

    let mut candidates = scanner.scan().candidates;
    let mut recovery = scanner.scan_recovery();

    if filter {
        let metadata = JsonLinesMetadata::new(&config.backends.metadata_file);
        let mut stats = GcCycleStats::default();
        let filtered = filter_in_use(
            candidates,
            recovery,
            &metadata,
            config.gc.primary_wal_dir()?,
            &config.credentials,
            &mut stats,
        )?;
        println!("{} candidates still in use", stats.in_use);
        candidates = filtered.candidates;
        recovery = filtered.recovery;
    }

    let groups = candidates.group_by_server();
    for path in &groups.legacy {
        println!("legacy\t{}", path.display());
    }
    for (server, paths) in &groups.servers {
        for path in paths {
            println!("{}\t{}", server, path.display());
        }
    }
    for (dir, paths) in &groups.unrecognized {
        for path in paths {
            println!("kept {}\t{}", dir, path.display());
        }
    }
    for path in recovery.values() {
        println!("recovery\t{}", path.display());
    }

    println!(
        "{} WAL files on {} servers, {} legacy, {} recovery logs",
        groups.file_count(),
        groups.servers.len(),
        groups.legacy.len(),
        recovery.len()
    );
    Ok(())
}

async fn collect(config: &DeploymentConfig) -> Result<()> {
    let collaborators = Collaborators::local(&config.gc, &config.backends);
    let collector = GarbageCollector::new(
        config.gc.clone(),
        GcContext::new(config.credentials.clone()),
        collaborators,
    )?;

    match collector.collect().await {
        CollectOutcome::Completed(stats) => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        CollectOutcome::Failed(stats) => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            bail!("collection cycle failed")
        }
        CollectOutcome::Skipped => bail!("another collection cycle is running"),
    }
}
