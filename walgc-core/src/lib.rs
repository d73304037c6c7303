//! walgc Core - Write-Ahead Log Garbage Collector
//!
//! Tablet servers append every mutation to a write-ahead log before it is
//! merged into sorted storage. Logs become obsolete once replayed, once a
//! newer log supersedes them, or when the server writing them dies. This
//! crate finds those logs and removes them without ever touching one that a
//! tablet may still need for recovery.
//!
//! # Architecture
//!
//! Each collection cycle reconciles three views that change independently:
//!
//! - **Volume**: the WAL and recovery directories on the file system
//! - **Metadata table**: the logs each tablet still references
//! - **Coordination service**: which tablet servers hold their lock
//!
//! The [`GarbageCollector`] runs scan → cross-reference → dispatch in that
//! order. Files of live servers are only removed by the servers themselves.

pub mod collector;
pub mod config;
pub mod dispatch;
pub mod fs;
pub mod liveness;
pub mod metadata;
pub mod rpc;
pub mod scanner;

mod error;
mod types;

#[cfg(test)]
mod testing;

pub use collector::{CollectOutcome, Collaborators, GarbageCollector, GcContext};
pub use config::{DeploymentConfig, GcConfig};
pub use error::{CoordinationError, GcError, Result};
pub use types::*;

/// walgc version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
