//! The single upstream MONITOR connection owned by a hub.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::monitor::error::{ConnectError, StreamError};
use crate::monitor::event::{MonitorEvent, parse_monitor_line};

/// Factory for raw monitoring connections, one per call.
#[async_trait]
pub trait MonitorConnector: Send + Sync {
    async fn open(&self, instance_id: &str) -> Result<Box<dyn RawLineStream>, ConnectError>;
}

/// Lazy, non-restartable sequence of raw MONITOR lines.
///
/// `next_line` must be cancel-safe: dropping its future before completion
/// must not lose data. `close` must be idempotent. Every error except
/// [`StreamError::LineTooLong`] ends the stream.
#[async_trait]
pub trait RawLineStream: Send {
    async fn next_line(&mut self) -> Result<String, StreamError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Command(MonitorEvent),
    /// Final element: the connection is gone and will not produce more.
    Terminated(StreamError),
}

pub struct UpstreamMonitorSource {
    instance_id: String,
    stream: Option<Box<dyn RawLineStream>>,
    terminated: bool,
}

impl UpstreamMonitorSource {
    /// Opens a connection through `connector`, bounded by `connect_timeout`.
    ///
    /// The returned future owns everything it needs, so a hub can keep it
    /// pending while it serves other commands, or drop it to abandon the
    /// attempt.
    pub async fn open(
        connector: Arc<dyn MonitorConnector>,
        instance_id: String,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let stream = match tokio::time::timeout(connect_timeout, connector.open(&instance_id)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(ConnectError::Timeout),
        };

        info!(instance_id = %instance_id, "upstream monitor connection opened");

        Ok(Self::from_stream(&instance_id, stream))
    }

    pub fn from_stream(instance_id: &str, stream: Box<dyn RawLineStream>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            stream: Some(stream),
            terminated: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Next decoded event, or `None` once the source is closed or already
    /// yielded [`SourceEvent::Terminated`].
    ///
    /// Cancel-safe as long as the underlying [`RawLineStream`] is.
    pub async fn next_event(&mut self) -> Option<SourceEvent> {
        if self.terminated {
            return None;
        }

        let stream = self.stream.as_mut()?;

        match stream.next_line().await {
            Ok(line) => Some(SourceEvent::Command(parse_monitor_line(&line))),
            Err(StreamError::LineTooLong(preview)) => {
                warn!(instance_id = %self.instance_id, "skipped over-long monitor line");
                Some(SourceEvent::Command(MonitorEvent::malformed(&preview)))
            }
            Err(error) => {
                self.terminated = true;
                Some(SourceEvent::Terminated(error))
            }
        }
    }

    /// Releases the connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close().await;
            debug!(instance_id = %self.instance_id, "upstream monitor connection closed");
        }
        self.terminated = true;
    }
}

impl std::fmt::Debug for UpstreamMonitorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamMonitorSource")
            .field("instance_id", &self.instance_id)
            .field("open", &self.stream.is_some())
            .field("terminated", &self.terminated)
            .finish()
    }
}
