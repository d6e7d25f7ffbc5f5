//! TCP socket link to an ethernet gateway.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::link::{LineSink, LineSource, Transport};
use crate::{Result, TransportError};

/// TCP link configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Gateway host name or address.
    pub host: String,
    /// Gateway port, conventionally 5003.
    pub port: u16,
}

impl TcpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

/// TCP transport: line-delimited text over a socket.
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<(Box<dyn LineSource>, Box<dyn LineSink>)> {
        if self.config.host.is_empty() {
            return Err(TransportError::InvalidConfig("empty TCP host".into()));
        }

        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        stream.set_nodelay(true)?;
        tracing::info!(host = %self.config.host, port = self.config.port, "connected to gateway");

        let (read_half, write_half) = stream.into_split();
        Ok((
            Box::new(TcpLineSource {
                reader: BufReader::new(read_half),
            }),
            Box::new(TcpLineSink { writer: write_half }),
        ))
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Socket halves are owned by the source/sink; dropping them closes
        // the connection.
        Ok(())
    }
}

struct TcpLineSource {
    reader: BufReader<OwnedReadHalf>,
}

#[async_trait]
impl LineSource for TcpLineSource {
    async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

struct TcpLineSink {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl LineSink for TcpLineSink {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}
