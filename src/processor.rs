use std::collections::BTreeMap;

use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::stream::TelemetryEvent;

/// Wire envelope published on the partition topics.
#[derive(Debug, Deserialize)]
struct Envelope {
    body: String,
    #[serde(default)]
    properties: BTreeMap<String, Value>,
}

/// One decoded telemetry event: the body text plus the names of all
/// triggered condition flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub body: String,
    pub alerts: Vec<String>,
}

/// Decode a raw event. A property counts as triggered only when its textual
/// value is exactly `true`; anything else ("1", "True", numbers) does not.
pub fn process(event: &TelemetryEvent) -> Result<Telemetry> {
    let text = std::str::from_utf8(&event.payload)
        .map_err(|e| Error::Decode(format!("payload is not UTF-8: {e}")))?;
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| Error::Decode(format!("bad envelope: {e}")))?;

    let alerts = envelope
        .properties
        .iter()
        .filter(|(_, value)| is_triggered(value))
        .map(|(key, _)| key.clone())
        .collect();

    Ok(Telemetry {
        body: envelope.body,
        alerts,
    })
}

fn is_triggered(value: &Value) -> bool {
    match value {
        Value::String(text) => text == "true",
        Value::Bool(flag) => *flag,
        _ => false,
    }
}

/// Destination for decoded telemetry. The production sink logs; tests record.
pub trait TelemetrySink {
    fn record(&mut self, partition: &str, telemetry: Telemetry);
}

pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&mut self, partition: &str, telemetry: Telemetry) {
        info!("[{partition}] telemetry received: {}", telemetry.body);
        for key in &telemetry.alerts {
            warn!("[{partition}] condition triggered: {key}");
        }
    }
}
