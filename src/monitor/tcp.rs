//! MONITOR connections over plain TCP.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::config::ConnectionParams;
use crate::input::{LineReadError, LineReader, send_command};
use crate::monitor::error::{ConnectError, StreamError};
use crate::monitor::source::{MonitorConnector, RawLineStream};
use crate::resp::RespValue;

/// Opens MONITOR connections for a fixed set of known instances.
#[derive(Debug, Default, Clone)]
pub struct TcpMonitorConnector {
    instances: HashMap<String, ConnectionParams>,
}

impl TcpMonitorConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, instance_id: &str, params: ConnectionParams) -> Self {
        self.insert(instance_id, params);
        self
    }

    pub fn insert(&mut self, instance_id: &str, params: ConnectionParams) {
        self.instances.insert(instance_id.to_string(), params);
    }
}

#[async_trait]
impl MonitorConnector for TcpMonitorConnector {
    async fn open(&self, instance_id: &str) -> Result<Box<dyn RawLineStream>, ConnectError> {
        let params = self
            .instances
            .get(instance_id)
            .ok_or_else(|| ConnectError::UnknownInstance(instance_id.to_string()))?;

        let stream = TcpStream::connect(params.address())
            .await
            .map_err(|e| ConnectError::Io(e.to_string()))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = LineReader::new(reader);

        if let Some(password) = &params.password {
            let mut auth = vec!["AUTH".to_string()];
            if let Some(username) = &params.username {
                auth.push(username.clone());
            }
            auth.push(password.clone());

            expect_ok(&mut reader, &mut writer, RespValue::command(auth)).await?;
        }

        expect_ok(&mut reader, &mut writer, RespValue::command(["MONITOR"])).await?;
        debug!(instance_id, address = %params.address(), "MONITOR accepted");

        Ok(Box::new(TcpLineStream {
            reader,
            writer: Some(writer),
        }))
    }
}

async fn expect_ok(
    reader: &mut LineReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    command: RespValue,
) -> Result<(), ConnectError> {
    match send_command(reader, writer, &command).await? {
        RespValue::SimpleString(reply) if reply == "OK" => Ok(()),
        RespValue::Error(message) => Err(ConnectError::Rejected(message)),
        other => Err(ConnectError::Protocol(other.encode().trim_end().to_string())),
    }
}

#[derive(Debug)]
pub struct TcpLineStream {
    reader: LineReader<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
}

#[async_trait]
impl RawLineStream for TcpLineStream {
    async fn next_line(&mut self) -> Result<String, StreamError> {
        if self.writer.is_none() {
            return Err(StreamError::Closed);
        }

        let line = match self.reader.read_line().await {
            Ok(line) => line,
            Err(LineReadError::LineTooLong(preview)) => {
                let preview = preview.strip_prefix('+').unwrap_or(preview.as_str());
                return Err(StreamError::LineTooLong(preview.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        if let Some(entry) = line.strip_prefix('+') {
            Ok(entry.to_string())
        } else if let Some(message) = line.strip_prefix('-') {
            Err(StreamError::Server(message.to_string()))
        } else {
            Ok(line)
        }
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}
