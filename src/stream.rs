use std::time::{Duration, Instant};

use chrono::Utc;
use log::debug;
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS, Transport};

use crate::auth;
use crate::config::StreamConfig;
use crate::error::{Error, Result};

/// How long topology discovery may take before the endpoint is considered
/// unreachable.
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(10);

const API_VERSION: &str = "2021-04-12";

/// One raw event as received from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub payload: Vec<u8>,
}

/// The narrow surface the consumer needs from the event-stream service.
pub trait EventStream: Send + Sync {
    type Reader: PartitionReader + Send + 'static;

    /// Partition topology, queried once at startup.
    fn partitions(&self) -> Result<Vec<String>>;

    /// Open a receive cursor on one partition, starting at "now".
    fn open_reader(&self, partition: &str) -> Result<Self::Reader>;
}

pub trait PartitionReader {
    /// Wait up to `timeout` for events, then drain without blocking up to
    /// `max_events`. An empty batch means nothing was ready, not a failure.
    fn receive(&mut self, max_events: usize, timeout: Duration) -> Result<Vec<TelemetryEvent>>;

    /// Release the cursor. Called on clean shutdown.
    fn close(&mut self) {}
}

pub(crate) fn topology_topic(path: &str) -> String {
    format!("{path}/partitions")
}

pub(crate) fn partition_topic(path: &str, partition: &str) -> String {
    format!("{path}/partitions/{partition}")
}

fn parse_partition_list(payload: &[u8]) -> Result<Vec<String>> {
    let ids: Vec<String> = serde_json::from_slice(payload)
        .map_err(|e| Error::Connection(format!("malformed partition topology: {e}")))?;
    if ids.is_empty() {
        return Err(Error::Connection("partition topology is empty".into()));
    }
    Ok(ids)
}

/// Event stream over the hub's MQTT endpoint. The hub publishes the
/// partition topology as a retained JSON array on `<path>/partitions` and
/// each partition's events on `<path>/partitions/<id>`.
pub struct MqttEventStream {
    config: StreamConfig,
}

impl MqttEventStream {
    pub fn new(config: StreamConfig) -> MqttEventStream {
        MqttEventStream { config }
    }

    fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        let config = &self.config;
        let mut options = MqttOptions::new(client_id, &config.hostname, config.port);
        options
            .set_transport(Transport::tls_with_default_config())
            .set_keep_alive(Duration::from_secs(5))
            .set_credentials(
                format!(
                    "{}/{}/?api-version={API_VERSION}",
                    config.hostname, config.key_name
                ),
                auth::stream_signature(
                    &config.key,
                    &config.hostname,
                    &config.key_name,
                    &config.path,
                    &(Utc::now() + Duration::from_secs(600)),
                ),
            );
        options
    }
}

impl EventStream for MqttEventStream {
    type Reader = MqttPartitionReader;

    fn partitions(&self) -> Result<Vec<String>> {
        let (mut client, mut connection) = Client::new(self.mqtt_options("buoywatch-discovery"), 10);
        let topic = topology_topic(&self.config.path);
        client
            .subscribe(&topic, QoS::AtLeastOnce)
            .map_err(|e| Error::Connection(e.to_string()))?;

        let deadline = Instant::now() + DISCOVERY_DEADLINE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Connection(format!(
                    "no partition topology on {topic} within {DISCOVERY_DEADLINE:?}"
                )));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let ids = parse_partition_list(&publish.payload)?;
                    let _ = client.disconnect();
                    return Ok(ids);
                }
                // Connection handshake and keep-alive traffic
                Ok(Ok(event)) => debug!("discovery: {event:?}"),
                Ok(Err(e)) => return Err(Error::Connection(e.to_string())),
                Err(_) => {} // timed out, deadline check decides
            }
        }
    }

    fn open_reader(&self, partition: &str) -> Result<MqttPartitionReader> {
        let client_id = format!("buoywatch-reader-{partition}");
        let (mut client, connection) = Client::new(self.mqtt_options(&client_id), 10);
        let topic = partition_topic(&self.config.path, partition);
        client
            .subscribe(&topic, QoS::AtLeastOnce)
            .map_err(|e| Error::StreamRead {
                partition: partition.to_string(),
                reason: e.to_string(),
            })?;

        Ok(MqttPartitionReader {
            partition: partition.to_string(),
            client,
            connection,
        })
    }
}

/// Receive cursor on one partition, backed by its own connection and
/// subscription. Subscribing fresh means only events published after
/// startup are observed; retained publishes are older and get dropped.
pub struct MqttPartitionReader {
    partition: String,
    client: Client,
    connection: Connection,
}

impl PartitionReader for MqttPartitionReader {
    fn receive(&mut self, max_events: usize, timeout: Duration) -> Result<Vec<TelemetryEvent>> {
        let mut events = Vec::new();
        let mut wait = timeout;
        while events.len() < max_events {
            match self.connection.recv_timeout(wait) {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    if publish.retain {
                        debug!("partition {}: dropping retained publish", self.partition);
                        continue;
                    }
                    events.push(TelemetryEvent {
                        payload: publish.payload.to_vec(),
                    });
                    // First event in hand: drain the rest without blocking
                    wait = Duration::ZERO;
                }
                Ok(Ok(event)) => debug!("partition {}: {event:?}", self.partition),
                Ok(Err(e)) => {
                    return Err(Error::StreamRead {
                        partition: self.partition.clone(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => break, // nothing ready this pass
            }
        }
        Ok(events)
    }

    fn close(&mut self) {
        let _ = self.client.disconnect();
    }
}
