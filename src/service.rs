use std::time::Duration;

use chrono::Utc;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth;
use crate::config::ServiceConfig;
use crate::error::{Error, Result};

const API_VERSION: &str = "2021-04-12";

/// Client for the hub's device-facing service API: direct methods, twin
/// read/patch and device queries. All operations are one-shot startup
/// helpers; a failure here never touches the consumer loops.
pub struct ServiceClient {
    config: ServiceConfig,
    http: reqwest::blocking::Client,
}

/// Outcome of a direct method call, as reported by the device.
#[derive(Debug, Deserialize)]
pub struct MethodResponse {
    pub status: u16,
    #[serde(default)]
    pub payload: Value,
}

/// The slice of a device twin this tool touches.
#[derive(Debug, Deserialize)]
pub struct Twin {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub etag: String,
}

impl ServiceClient {
    pub fn new(config: ServiceConfig, timeout: Duration) -> Result<ServiceClient> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RemoteCall(e.to_string()))?;
        Ok(ServiceClient { config, http })
    }

    fn authorization(&self) -> String {
        auth::service_signature(
            &self.config.key,
            &self.config.hostname,
            &self.config.key_name,
            &(Utc::now() + Duration::from_secs(600)),
        )
    }

    /// Invoke a direct method on a device and return the device's status
    /// and response payload.
    pub fn invoke_method(
        &self,
        device_id: &str,
        method: &str,
        payload: &Value,
        response_timeout: Duration,
    ) -> Result<MethodResponse> {
        let url = method_url(&self.config.hostname, device_id);
        let body = method_request_body(method, payload, response_timeout);
        debug!("invoking {method} on {device_id}");

        let response = self
            .http
            .post(url)
            .header("Authorization", self.authorization())
            .json(&body)
            .send()
            .map_err(|e| Error::RemoteCall(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteCall(format!(
                "method {method} on {device_id} returned {status}"
            )));
        }
        response
            .json()
            .map_err(|e| Error::RemoteCall(format!("bad method response: {e}")))
    }

    pub fn get_twin(&self, device_id: &str) -> Result<Twin> {
        let response = self
            .http
            .get(twin_url(&self.config.hostname, device_id))
            .header("Authorization", self.authorization())
            .send()
            .map_err(|e| Error::RemoteCall(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteCall(format!(
                "twin read for {device_id} returned {status}"
            )));
        }
        response
            .json()
            .map_err(|e| Error::RemoteCall(format!("bad twin document: {e}")))
    }

    /// Patch a twin guarded by its version tag; a concurrent writer makes
    /// the hub reject the patch with 412.
    pub fn update_twin(&self, device_id: &str, patch: &Value, etag: &str) -> Result<()> {
        let response = self
            .http
            .patch(twin_url(&self.config.hostname, device_id))
            .header("Authorization", self.authorization())
            .header("If-Match", if_match(etag))
            .json(patch)
            .send()
            .map_err(|e| Error::RemoteCall(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteCall(format!(
                "twin patch for {device_id} returned {status}"
            )));
        }
        Ok(())
    }

    /// Run a twin query and return the matching device ids.
    pub fn query_device_ids(&self, query: &str, page_size: u32) -> Result<Vec<String>> {
        let response = self
            .http
            .post(query_url(&self.config.hostname))
            .header("Authorization", self.authorization())
            .header("x-ms-max-item-count", page_size)
            .json(&json!({ "query": query }))
            .send()
            .map_err(|e| Error::RemoteCall(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteCall(format!("device query returned {status}")));
        }

        let rows: Vec<Value> = response
            .json()
            .map_err(|e| Error::RemoteCall(format!("bad query response: {e}")))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("deviceId").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

fn method_url(hostname: &str, device_id: &str) -> String {
    format!("https://{hostname}/twins/{device_id}/methods?api-version={API_VERSION}")
}

fn twin_url(hostname: &str, device_id: &str) -> String {
    format!("https://{hostname}/twins/{device_id}?api-version={API_VERSION}")
}

fn query_url(hostname: &str) -> String {
    format!("https://{hostname}/devices/query?api-version={API_VERSION}")
}

fn method_request_body(method: &str, payload: &Value, response_timeout: Duration) -> Value {
    json!({
        "methodName": method,
        "responseTimeoutInSeconds": response_timeout.as_secs(),
        "payload": payload,
    })
}

/// Patch applied to the target buoy's twin: site tags plus the desired
/// reporting setpoints.
pub fn twin_patch_body(project: &str, site: &str) -> Value {
    json!({
        "tags": {
            "project": project,
            "site": site,
        },
        "properties": {
            "desired": {
                "patchId": "set site values",
                "reporting_interval_secs": "300",
                "sample_depth_m": "5",
            }
        }
    })
}

pub fn site_query(site: &str) -> String {
    format!("SELECT * FROM devices WHERE tags.site = '{site}'")
}

fn if_match(etag: &str) -> String {
    // The hub wants the version tag quoted
    if etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{etag}\"")
    }
}
