//! Serial (UART) link to a gateway device.

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::mpsc;

use crate::link::{LineSink, LineSource, Transport};
use crate::{Result, TransportError};

/// Poll timeout for the blocking read loop; bounds how long a stop takes.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Serial link configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    /// Baud rate, e.g. 115200.
    pub baud_rate: u32,
    /// Pulse DTR before use to hard-reset the attached radio.
    pub hard_reset: bool,
    /// Wait after opening the port before declaring the link ready. USB
    /// serial adapters auto-reset the attached controller on open, so the
    /// remote end needs a moment to boot.
    pub settle_delay: Duration,
}

impl SerialConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            hard_reset: false,
            settle_delay: Duration::from_secs(3),
        }
    }
}

/// Serial transport: 8N1, no flow control, line-delimited text.
pub struct SerialTransport {
    config: SerialConfig,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<(Box<dyn LineSource>, Box<dyn LineSink>)> {
        if self.config.port.is_empty() {
            return Err(TransportError::InvalidConfig("empty serial port path".into()));
        }

        let mut port = serialport::new(&self.config.port, self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;

        tracing::info!(
            port = %self.config.port,
            baud = self.config.baud_rate,
            "opened serial port"
        );

        if self.config.hard_reset {
            port.write_data_terminal_ready(false)?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            port.write_data_terminal_ready(true)?;
            tracing::debug!("pulsed DTR for hard reset");
        }

        // Give the remote controller time to finish its boot/auto-reset.
        tokio::time::sleep(self.config.settle_delay).await;

        let reader_port = port.try_clone()?;
        let (tx, rx) = mpsc::channel(64);
        tokio::task::spawn_blocking(move || read_loop(reader_port, tx));

        Ok((
            Box::new(SerialLineSource { rx }),
            Box::new(SerialLineSink { port }),
        ))
    }

    async fn disconnect(&mut self) -> Result<()> {
        // The port handles live in the source/sink halves; dropping them
        // closes the device.
        Ok(())
    }
}

/// Blocking read loop, bridged to async via an mpsc pipe. Exits when the
/// receiving half is dropped or the port fails.
fn read_loop(mut port: Box<dyn SerialPort>, tx: mpsc::Sender<String>) {
    let mut buf = [0u8; 512];
    let mut acc: Vec<u8> = Vec::new();
    loop {
        match port.read(&mut buf) {
            Ok(0) => {
                tracing::debug!("serial port closed");
                return;
            }
            Ok(n) => {
                for &byte in &buf[..n] {
                    if byte == b'\n' {
                        let line = String::from_utf8_lossy(&acc).into_owned();
                        acc.clear();
                        if tx.blocking_send(line).is_err() {
                            return;
                        }
                    } else {
                        acc.push(byte);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if tx.is_closed() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "serial read failed");
                return;
            }
        }
    }
}

struct SerialLineSource {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl LineSource for SerialLineSource {
    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

struct SerialLineSink {
    port: Box<dyn SerialPort>,
}

#[async_trait]
impl LineSink for SerialLineSink {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        // Writes are a handful of bytes at gateway baud rates; a blocking
        // write from the dedicated Writer task is acceptable.
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }
}
