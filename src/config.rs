use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;

use crate::auth::SasKey;
use crate::error::{Error, Result};

const DEFAULT_STREAM_PORT: u16 = 8883;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 100;
const DEFAULT_MAX_BATCH: usize = 100;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the partitioned telemetry stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub key_name: String,
    pub key: SasKey,
    pub receive_timeout: Duration,
    pub max_batch: usize,
}

/// Connection settings for the hub service API, parsed from a
/// `HostName=...;SharedAccessKeyName=...;SharedAccessKey=...` string.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub hostname: String,
    pub key_name: String,
    pub key: SasKey,
}

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub method: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub project: String,
    pub site: String,
}

/// Optional one-shot steps executed before the consumer starts.
#[derive(Debug, Clone)]
pub struct StartupConfig {
    pub device_id: Option<String>,
    pub command: Option<CommandConfig>,
    pub site: Option<SiteConfig>,
    pub command_timeout: Duration,
}

impl StartupConfig {
    pub fn is_enabled(&self) -> bool {
        self.command.is_some() || self.site.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub stream: StreamConfig,
    pub service: Option<ServiceConfig>,
    pub startup: StartupConfig,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let endpoint = require(&get, "BUOYWATCH_STREAM_ENDPOINT")?;
        let (hostname, port) = split_endpoint(&endpoint)?;

        let stream = StreamConfig {
            hostname,
            port,
            path: require(&get, "BUOYWATCH_STREAM_PATH")?,
            key_name: require(&get, "BUOYWATCH_STREAM_KEY_NAME")?,
            key: SasKey::new(&require(&get, "BUOYWATCH_STREAM_KEY")?)?,
            receive_timeout: Duration::from_millis(parse_or(
                &get,
                "BUOYWATCH_RECEIVE_TIMEOUT_MS",
                DEFAULT_RECEIVE_TIMEOUT_MS,
            )?),
            max_batch: parse_or(&get, "BUOYWATCH_MAX_BATCH", DEFAULT_MAX_BATCH)?,
        };

        let service = match get("BUOYWATCH_SERVICE_CONNECTION_STRING") {
            Some(value) => Some(parse_connection_string(&value)?),
            None => None,
        };

        let command = get("BUOYWATCH_STARTUP_COMMAND").map(|method| {
            let raw = get("BUOYWATCH_STARTUP_COMMAND_PAYLOAD").unwrap_or_else(|| "on".into());
            // A payload that is not valid JSON is sent as a JSON string
            let payload = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            CommandConfig { method, payload }
        });

        let site = match (get("BUOYWATCH_PROJECT"), get("BUOYWATCH_SITE")) {
            (Some(project), Some(site)) => Some(SiteConfig { project, site }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "BUOYWATCH_PROJECT and BUOYWATCH_SITE must be set together".into(),
                ))
            }
        };

        let startup = StartupConfig {
            device_id: get("BUOYWATCH_DEVICE_ID"),
            command,
            site,
            command_timeout: Duration::from_secs(parse_or(
                &get,
                "BUOYWATCH_COMMAND_TIMEOUT_SECS",
                DEFAULT_COMMAND_TIMEOUT_SECS,
            )?),
        };

        if startup.is_enabled() {
            if service.is_none() {
                return Err(Error::Config(
                    "BUOYWATCH_SERVICE_CONNECTION_STRING is required when a startup step is configured".into(),
                ));
            }
            if startup.device_id.is_none() {
                return Err(Error::Config(
                    "BUOYWATCH_DEVICE_ID is required when a startup step is configured".into(),
                ));
            }
        }

        Ok(Config {
            stream,
            service,
            startup,
        })
    }
}

fn require(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    match get(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::Config(format!("{name} is not set"))),
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T> {
    match get(name) {
        Some(value) => value
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {value}"))),
        None => Ok(default),
    }
}

fn split_endpoint(endpoint: &str) -> Result<(String, u16)> {
    match endpoint.split_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| {
                Error::Config(format!("invalid port in stream endpoint: {endpoint}"))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((endpoint.to_string(), DEFAULT_STREAM_PORT)),
    }
}

fn parse_connection_string(connection_string: &str) -> Result<ServiceConfig> {
    let mut hostname = None;
    let mut key_name = None;
    let mut key = None;

    for part in connection_string.split(';') {
        if let Some(value) = part.strip_prefix("HostName=") {
            hostname = Some(value);
        } else if let Some(value) = part.strip_prefix("SharedAccessKeyName=") {
            key_name = Some(value);
        } else if let Some(value) = part.strip_prefix("SharedAccessKey=") {
            key = Some(value);
        }
    }

    let missing = |field: &str| Error::Config(format!("connection string is missing {field}"));

    Ok(ServiceConfig {
        hostname: hostname.ok_or_else(|| missing("HostName"))?.to_string(),
        key_name: key_name.ok_or_else(|| missing("SharedAccessKeyName"))?.to_string(),
        key: SasKey::new(key.ok_or_else(|| missing("SharedAccessKey"))?)?,
    })
}
