//! MQTT bridged link.
//!
//! MQTT gateways do not expose a byte stream. The broker carries one topic
//! per message slot, `<prefix>-out/node/child/type/ack/subtype` for
//! device→bridge traffic and `<prefix>-in/...` for bridge→device, with the
//! value as the MQTT payload. This transport synthesizes protocol lines
//! from inbound publishes through an in-process pipe and maps outbound
//! lines back onto topics, so the connection layer above sees the same
//! [`LineSource`]/[`LineSink`] contract as the stream links.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::link::{LineSink, LineSource, Transport};
use crate::{Result, TransportError};

/// MQTT link configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host name or address.
    pub broker: String,
    /// Broker port, conventionally 1883.
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Topic prefix; the bridge subscribes `<prefix>-out/#` and publishes
    /// under `<prefix>-in/`.
    pub topic_prefix: String,
    /// Optional credentials.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>, topic_prefix: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: 1883,
            client_id: "sensegate".to_string(),
            topic_prefix: topic_prefix.into(),
            username: None,
            password: None,
            keep_alive_secs: 60,
        }
    }
}

/// MQTT transport bridging topic publish/subscribe into protocol lines.
pub struct MqttTransport {
    config: MqttConfig,
    client: Option<AsyncClient>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self { config, client: None }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(Box<dyn LineSource>, Box<dyn LineSink>)> {
        if self.config.broker.is_empty() {
            return Err(TransportError::InvalidConfig("empty MQTT broker".into()));
        }
        if self.config.topic_prefix.is_empty() {
            return Err(TransportError::InvalidConfig("empty MQTT topic prefix".into()));
        }

        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.broker, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let out_prefix = format!("{}-out", self.config.topic_prefix);
        client
            .subscribe(format!("{out_prefix}/#"), QoS::AtLeastOnce)
            .await?;
        tracing::info!(
            broker = %self.config.broker,
            prefix = %self.config.topic_prefix,
            "subscribed to gateway topics"
        );

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match topic_to_line(&out_prefix, &publish.topic, &publish.payload) {
                            Some(line) => {
                                if tx.send(line).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                tracing::warn!(topic = %publish.topic, "unmappable topic, skipped")
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "MQTT event loop failed");
                        return;
                    }
                }
            }
        });

        self.client = Some(client.clone());
        Ok((
            Box::new(MqttLineSource { rx }),
            Box::new(MqttLineSink {
                client,
                in_prefix: format!("{}-in", self.config.topic_prefix),
            }),
        ))
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            // Best effort; the broker may already be gone.
            let _ = client.disconnect().await;
        }
        Ok(())
    }
}

/// Map an inbound publish onto a protocol line. Returns `None` when the
/// topic does not follow `<prefix>/node/child/type/ack/subtype`.
fn topic_to_line(out_prefix: &str, topic: &str, payload: &[u8]) -> Option<String> {
    let rest = topic.strip_prefix(out_prefix)?.strip_prefix('/')?;
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() != 5 {
        return None;
    }
    let payload = String::from_utf8_lossy(payload);
    Some(format!("{};{}", segments.join(";"), payload))
}

/// Map an outbound line onto its topic and payload.
fn line_to_topic(in_prefix: &str, line: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = line.splitn(6, ';').collect();
    if fields.len() != 6 {
        return None;
    }
    let topic = format!(
        "{}/{}/{}/{}/{}/{}",
        in_prefix, fields[0], fields[1], fields[2], fields[3], fields[4]
    );
    Some((topic, fields[5].to_string()))
}

struct MqttLineSource {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl LineSource for MqttLineSource {
    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

struct MqttLineSink {
    client: AsyncClient,
    in_prefix: String,
}

#[async_trait]
impl LineSink for MqttLineSink {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let (topic, payload) = line_to_topic(&self.in_prefix, line)
            .ok_or_else(|| TransportError::Mqtt(format!("unmappable line: {line:?}")))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_topic_to_line() {
        let line = topic_to_line("mygateway1-out", "mygateway1-out/12/6/1/0/0", b"21.5");
        assert_eq!(line.as_deref(), Some("12;6;1;0;0;21.5"));
    }

    #[test]
    fn rejects_foreign_topics() {
        assert!(topic_to_line("mygateway1-out", "other/12/6/1/0/0", b"x").is_none());
        assert!(topic_to_line("mygateway1-out", "mygateway1-out/12/6/1/0", b"x").is_none());
        assert!(topic_to_line("mygateway1-out", "mygateway1-out/12/6/1/0/0/9", b"x").is_none());
    }

    #[test]
    fn maps_line_to_topic() {
        let (topic, payload) = line_to_topic("mygateway1-in", "12;6;1;0;0;21.5").unwrap();
        assert_eq!(topic, "mygateway1-in/12/6/1/0/0");
        assert_eq!(payload, "21.5");
    }

    #[test]
    fn outbound_payload_keeps_separators() {
        let (_, payload) = line_to_topic("p-in", "1;2;1;0;47;a;b;c").unwrap();
        assert_eq!(payload, "a;b;c");
    }
}
