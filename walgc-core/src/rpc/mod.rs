//! Calls from the collector to tablet servers
//!
//! The only call is `remove_logs`: a live server is asked to close and
//! remove WAL files it no longer needs. Clients are checked out of a
//! [`ClientPool`] as a [`PooledClient`] guard that goes back to the pool
//! when dropped, or is discarded if a call on it failed.

mod tcp;

pub use tcp::{RemoveLogsRequest, RemoveLogsResponse, TcpClientFactory, TcpTabletClient};

use crate::{GcError, Result, ServerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// System credentials presented to tablet servers
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub principal: String,
    pub token: String,
}

impl Credentials {
    pub fn new(principal: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Trace context propagated with each call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub trace_id: u64,
    pub parent_id: u64,
}

impl TraceInfo {
    /// Start a new trace
    pub fn root() -> Self {
        let (trace_id, span_id) = Uuid::new_v4().as_u64_pair();
        Self {
            trace_id,
            parent_id: span_id,
        }
    }

    /// Context for a call made under this span
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            parent_id: Uuid::new_v4().as_u64_pair().0,
        }
    }
}

/// Connection to one tablet server
#[async_trait]
pub trait TabletClient: Send {
    /// Ask the server to remove the given WAL paths
    async fn remove_logs(
        &mut self,
        trace: TraceInfo,
        credentials: &Credentials,
        logs: Vec<String>,
    ) -> Result<()>;
}

/// Opens connections to tablet servers
#[async_trait]
pub trait TabletClientFactory: Send + Sync {
    async fn connect(&self, server: &ServerId, timeout: Duration) -> Result<Box<dyn TabletClient>>;
}

/// Pool of idle tablet server connections, keyed by server
pub struct ClientPool {
    factory: Arc<dyn TabletClientFactory>,
    idle: Mutex<HashMap<ServerId, Vec<Box<dyn TabletClient>>>>,
    max_idle: usize,
    timeout: Duration,
}

impl ClientPool {
    /// Create a new pool
    pub fn new(factory: Arc<dyn TabletClientFactory>, timeout: Duration, max_idle: usize) -> Self {
        Self {
            factory,
            idle: Mutex::new(HashMap::new()),
            max_idle,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reuse an idle connection to `server`, or open a new one
    pub async fn checkout(self: &Arc<Self>, server: &ServerId) -> Result<PooledClient> {
        let reused = self
            .idle
            .lock()
            .get_mut(server)
            .and_then(|clients| clients.pop());

        let client = match reused {
            Some(client) => client,
            None => {
                tokio::time::timeout(self.timeout, self.factory.connect(server, self.timeout))
                    .await
                    .map_err(|_| GcError::Timeout(server.to_string()))??
            }
        };

        Ok(PooledClient {
            pool: Arc::clone(self),
            server: server.clone(),
            client: Some(client),
            broken: false,
        })
    }

    /// Idle connections held for `server`
    pub fn idle_count(&self, server: &ServerId) -> usize {
        self.idle.lock().get(server).map_or(0, Vec::len)
    }

    fn release(&self, server: ServerId, client: Box<dyn TabletClient>) {
        let mut idle = self.idle.lock();
        let clients = idle.entry(server).or_default();
        if clients.len() < self.max_idle {
            clients.push(client);
        }
    }
}

/// A connection checked out of a [`ClientPool`]
pub struct PooledClient {
    pool: Arc<ClientPool>,
    server: ServerId,
    client: Option<Box<dyn TabletClient>>,
    broken: bool,
}

impl PooledClient {
    pub fn server(&self) -> &ServerId {
        &self.server
    }

    /// Call `remove_logs`, bounded by the pool timeout.
    ///
    /// Any failure marks the connection broken so it is not reused.
    pub async fn remove_logs(
        &mut self,
        trace: TraceInfo,
        credentials: &Credentials,
        logs: Vec<String>,
    ) -> Result<()> {
        let timeout = self.pool.timeout;
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| GcError::Internal("pooled client already released".into()))?;

        let call = client.remove_logs(trace, credentials, logs);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GcError::Timeout(self.server.to_string())),
        };

        if result.is_err() {
            self.broken = true;
        }
        result
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !self.broken {
                self.pool.release(self.server.clone(), client);
            }
        }
    }
}
