//! Fakes shared by unit tests

use crate::rpc::{Credentials, TabletClient, TabletClientFactory, TraceInfo};
use crate::{GcError, Result, ServerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const UUID_1: &str = "11111111-1111-4111-8111-111111111111";
pub const UUID_2: &str = "22222222-2222-4222-8222-222222222222";
pub const UUID_3: &str = "33333333-3333-4333-8333-333333333333";
pub const UUID_4: &str = "44444444-4444-4444-8444-444444444444";
pub const UUID_5: &str = "55555555-5555-4555-8555-555555555555";

/// How a fake tablet server answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerBehavior {
    Ack,
    /// Acknowledge after a short delay
    Slow,
    Fail,
    Hang,
    Panic,
    Unreachable,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<(ServerId, Vec<String>)>>,
    behaviors: Mutex<HashMap<ServerId, ServerBehavior>>,
    connections: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Client factory that records every `remove_logs` call
#[derive(Clone, Default)]
pub struct RecordingFactory {
    shared: Arc<Shared>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, server: &ServerId, behavior: ServerBehavior) {
        self.shared.behaviors.lock().insert(server.clone(), behavior);
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<(ServerId, Vec<String>)> {
        self.shared.calls.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Most `Slow` calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    fn behavior(&self, server: &ServerId) -> ServerBehavior {
        self.shared
            .behaviors
            .lock()
            .get(server)
            .copied()
            .unwrap_or(ServerBehavior::Ack)
    }
}

struct RecordingClient {
    server: ServerId,
    factory: RecordingFactory,
}

#[async_trait]
impl TabletClient for RecordingClient {
    async fn remove_logs(
        &mut self,
        _trace: TraceInfo,
        _credentials: &Credentials,
        logs: Vec<String>,
    ) -> Result<()> {
        self.factory
            .shared
            .calls
            .lock()
            .push((self.server.clone(), logs));

        match self.factory.behavior(&self.server) {
            ServerBehavior::Ack => Ok(()),
            ServerBehavior::Slow => {
                let shared = &self.factory.shared;
                let running = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                shared.max_in_flight.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            ServerBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            ServerBehavior::Panic => panic!("tablet client crashed talking to {}", self.server),
            ServerBehavior::Fail | ServerBehavior::Unreachable => {
                Err(GcError::transport(&self.server, "connection reset"))
            }
        }
    }
}

#[async_trait]
impl TabletClientFactory for RecordingFactory {
    async fn connect(
        &self,
        server: &ServerId,
        _timeout: Duration,
    ) -> Result<Box<dyn TabletClient>> {
        if self.behavior(server) == ServerBehavior::Unreachable {
            return Err(GcError::transport(server, "connection refused"));
        }
        self.shared.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingClient {
            server: server.clone(),
            factory: self.clone(),
        }))
    }
}
