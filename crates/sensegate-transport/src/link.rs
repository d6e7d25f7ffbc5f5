//! The transport contract shared by serial, TCP and MQTT links.

use async_trait::async_trait;

use crate::Result;

/// Inbound half of a link: yields protocol lines one at a time.
#[async_trait]
pub trait LineSource: Send {
    /// Next line, without its terminator. `Ok(None)` means the link closed
    /// cleanly; an error means it failed.
    async fn next_line(&mut self) -> Result<Option<String>>;
}

/// Outbound half of a link.
#[async_trait]
pub trait LineSink: Send {
    /// Write one protocol line; the sink appends the terminator the link
    /// needs (or maps the line onto a topic, for MQTT).
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Flush buffered output.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A way to reach the gateway device.
///
/// After `connect` returns both halves are ready for interleaved use; the
/// [`crate::Connection`] spawns the Reader and Writer workers on top of
/// them. Transports are explicitly constructed and owned by the caller;
/// there is no process-wide link registry.
#[async_trait]
pub trait Transport: Send {
    /// Establish the link and split it into its two halves.
    async fn connect(&mut self) -> Result<(Box<dyn LineSource>, Box<dyn LineSink>)>;

    /// Tear the link down. Must be idempotent.
    async fn disconnect(&mut self) -> Result<()>;
}
