//! Line-delimited JSON transport for tablet server calls

use super::{Credentials, TabletClient, TabletClientFactory, TraceInfo};
use crate::{GcError, Result, ServerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Request frame for `remove_logs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLogsRequest {
    pub trace: TraceInfo,
    pub credentials: Credentials,
    pub logs: Vec<String>,
}

/// Response frame for `remove_logs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLogsResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tablet server client speaking one JSON object per line
pub struct TcpTabletClient {
    server: ServerId,
    stream: BufReader<TcpStream>,
}

impl TcpTabletClient {
    /// Connect to a tablet server
    pub async fn connect(server: &ServerId, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(server.to_string()))
            .await
            .map_err(|_| GcError::Timeout(server.to_string()))?
            .map_err(|e| GcError::transport(server, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| GcError::transport(server, e))?;

        Ok(Self {
            server: server.clone(),
            stream: BufReader::new(stream),
        })
    }

    async fn call(&mut self, request: &RemoveLogsRequest) -> Result<RemoveLogsResponse> {
        let mut frame = serde_json::to_vec(request)
            .map_err(|e| GcError::Internal(format!("encode request: {}", e)))?;
        frame.push(b'\n');

        let stream = self.stream.get_mut();
        stream
            .write_all(&frame)
            .await
            .map_err(|e| GcError::transport(&self.server, e))?;
        stream
            .flush()
            .await
            .map_err(|e| GcError::transport(&self.server, e))?;

        let mut line = String::new();
        let read = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|e| GcError::transport(&self.server, e))?;
        if read == 0 {
            return Err(GcError::transport(&self.server, "connection closed"));
        }

        serde_json::from_str(line.trim_end())
            .map_err(|e| GcError::transport(&self.server, format!("bad response: {}", e)))
    }
}

#[async_trait]
impl TabletClient for TcpTabletClient {
    async fn remove_logs(
        &mut self,
        trace: TraceInfo,
        credentials: &Credentials,
        logs: Vec<String>,
    ) -> Result<()> {
        let request = RemoveLogsRequest {
            trace,
            credentials: credentials.clone(),
            logs,
        };

        let response = self.call(&request).await?;
        if response.ok {
            Ok(())
        } else {
            Err(GcError::transport(
                &self.server,
                response.error.unwrap_or_else(|| "request rejected".to_string()),
            ))
        }
    }
}

/// Factory producing [`TcpTabletClient`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpClientFactory;

#[async_trait]
impl TabletClientFactory for TcpClientFactory {
    async fn connect(&self, server: &ServerId, timeout: Duration) -> Result<Box<dyn TabletClient>> {
        Ok(Box::new(TcpTabletClient::connect(server, timeout).await?))
    }
}
