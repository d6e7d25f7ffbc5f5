//! In-process transport for tests and embedding.
//!
//! Presents the same contract as the real links, backed by a pair of
//! channels. Tests inject inbound lines and observe outbound lines through
//! the [`PipeHarness`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::link::{LineSink, LineSource, Transport};
use crate::{Result, TransportError};

/// Transport half of an in-process pipe.
pub struct PipeTransport {
    halves: Option<(PipeLineSource, PipeLineSink)>,
}

/// Test-side half: feed lines in, read written lines out.
pub struct PipeHarness {
    inbound_tx: mpsc::Sender<String>,
    outbound_rx: mpsc::Receiver<String>,
}

impl PipeTransport {
    /// Create a connected transport/harness pair.
    pub fn pair() -> (Self, PipeHarness) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        (
            Self {
                halves: Some((
                    PipeLineSource { rx: inbound_rx },
                    PipeLineSink { tx: outbound_tx },
                )),
            },
            PipeHarness {
                inbound_tx,
                outbound_rx,
            },
        )
    }
}

impl PipeHarness {
    /// Inject a line as if the remote device had sent it.
    pub async fn push_line(&self, line: impl Into<String>) {
        let _ = self.inbound_tx.send(line.into()).await;
    }

    /// Next line the bridge wrote, or `None` once the writer shut down.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound_rx.recv().await
    }

    /// Simulate the link dropping.
    pub fn close(&mut self) {
        let (tx, _) = mpsc::channel(1);
        self.inbound_tx = tx;
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn connect(&mut self) -> Result<(Box<dyn LineSource>, Box<dyn LineSink>)> {
        let (source, sink) = self
            .halves
            .take()
            .ok_or_else(|| TransportError::Closed("pipe already connected".into()))?;
        Ok((Box::new(source), Box::new(sink)))
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

struct PipeLineSource {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl LineSource for PipeLineSource {
    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

struct PipeLineSink {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl LineSink for PipeLineSink {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.tx
            .send(line.to_string())
            .await
            .map_err(|_| TransportError::Closed("pipe receiver dropped".into()))
    }
}
