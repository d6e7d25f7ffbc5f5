//! The Reader/Writer workers over an established link.
//!
//! A [`Connection`] owns one transport plus two long-lived tasks:
//!
//! - the **Reader** parses inbound lines into [`SensorMessage`]s and
//!   forwards them; malformed lines are logged and skipped, never fatal;
//! - the **Writer** drains the outbound queue, one message per
//!   `send_delay`, because gateway-side radios and serial buffers are slow.
//!
//! Both workers stop cooperatively: shutdown is a watch signal checked each
//! iteration, and [`Connection::shutdown`] joins them (writer first, so
//! nothing writes into a closing link) before tearing the transport down.

use std::sync::Arc;
use std::time::Duration;

use sensegate_protocol::SensorMessage;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::link::Transport;
use crate::Result;

const CHANNEL_CAPACITY: usize = 256;
const JOIN_WAIT: Duration = Duration::from_secs(2);

/// Tunables for an established connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Pause between outbound messages.
    pub send_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            send_delay: Duration::from_millis(200),
        }
    }
}

/// Externally visible state of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Both workers are running and the link is usable.
    Connected,
    /// The link failed or closed unexpectedly; the reason is carried for
    /// host-visible status reporting.
    Lost(String),
    /// Shut down deliberately.
    Closed,
}

/// A live, full-duplex connection to the gateway device.
pub struct Connection {
    transport: Box<dyn Transport>,
    outbound_tx: mpsc::Sender<SensorMessage>,
    inbound_rx: Option<mpsc::Receiver<SensorMessage>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connect the transport and spawn both workers. When this returns the
    /// link is ready for interleaved use.
    pub async fn establish(
        mut transport: Box<dyn Transport>,
        options: ConnectionOptions,
    ) -> Result<Self> {
        let (mut source, mut sink) = transport.connect().await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SensorMessage>(CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let status_tx = Arc::new(status_tx);

        let mut reader_shutdown = shutdown_tx.subscribe();
        let reader_status = status_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = reader_shutdown.changed() => {
                        // A dropped shutdown sender also means stop.
                        if changed.is_err() || *reader_shutdown.borrow() {
                            break;
                        }
                    }
                    line = source.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match SensorMessage::parse(&line) {
                                Ok(msg) => {
                                    if inbound_tx.send(msg).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(%line, error = %e, "dropped malformed line");
                                }
                            }
                        }
                        Ok(None) => {
                            let _ = reader_status.send(ConnectionStatus::Lost(
                                "link closed".to_string(),
                            ));
                            break;
                        }
                        Err(e) => {
                            let _ = reader_status.send(ConnectionStatus::Lost(e.to_string()));
                            break;
                        }
                    }
                }
            }
            tracing::debug!("reader stopped");
        });

        let mut writer_shutdown = shutdown_tx.subscribe();
        let writer_status = status_tx.clone();
        let send_delay = options.send_delay;
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = writer_shutdown.changed() => {
                        if changed.is_err() || *writer_shutdown.borrow() {
                            break;
                        }
                    }
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => {
                            let line = msg.serialize();
                            if let Err(e) = sink.write_line(&line).await {
                                let _ = writer_status.send(ConnectionStatus::Lost(e.to_string()));
                                break;
                            }
                            let _ = sink.flush().await;
                            tracing::trace!(%line, "sent");
                            tokio::time::sleep(send_delay).await;
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("writer stopped");
        });

        Ok(Self {
            transport,
            outbound_tx,
            inbound_rx: Some(inbound_rx),
            status_tx,
            status_rx,
            shutdown_tx,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Handle for enqueueing outbound messages; enqueue-and-return, the
    /// Writer paces the actual sends.
    pub fn sender(&self) -> mpsc::Sender<SensorMessage> {
        self.outbound_tx.clone()
    }

    /// Take the inbound message stream. The first caller becomes the sole
    /// consumer; later calls yield `None`.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<SensorMessage>> {
        self.inbound_rx.take()
    }

    /// Watch the link status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Stop both workers and tear the link down. Safe to call from any
    /// task, and a second call is a no-op.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(writer) = self.writer.take() {
            let _ = tokio::time::timeout(JOIN_WAIT, writer).await;
        }
        if let Some(reader) = self.reader.take() {
            let _ = tokio::time::timeout(JOIN_WAIT, reader).await;
        }
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(error = %e, "transport disconnect failed");
        }
        let _ = self.status_tx.send(ConnectionStatus::Closed);
    }
}
