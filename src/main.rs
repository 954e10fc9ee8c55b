mod auth;
mod config;
mod consumer;
mod error;
mod processor;
mod service;
mod stream;

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use config::{CommandConfig, Config, ServiceConfig, SiteConfig, StartupConfig};
use consumer::ReaderOptions;
use error::{Error, Result};
use service::ServiceClient;
use stream::{EventStream, MqttEventStream};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("buoywatch fleet operator");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(config) {
        error!("{e}");
        process::exit(1);
    }
}

fn run(config: Config) -> Result<()> {
    let Config {
        stream: stream_config,
        service,
        startup,
    } = config;

    let options = ReaderOptions {
        receive_timeout: stream_config.receive_timeout,
        max_batch: stream_config.max_batch,
    };
    let stream = MqttEventStream::new(stream_config);

    // Fatal on failure: no reader is started without a topology
    let partitions = stream.partitions()?;
    info!(
        "stream has {} partitions: {}",
        partitions.len(),
        partitions.join(", ")
    );

    if let Some(service) = service {
        if startup.is_enabled() {
            run_startup_steps(service, &startup);
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::Relaxed);
    })
    .map_err(|e| Error::Config(format!("cannot install signal handler: {e}")))?;

    let summary = consumer::run(Arc::new(stream), &partitions, options, stop)?;
    if !summary.failed.is_empty() {
        warn!("lost coverage of partitions: {}", summary.failed.join(", "));
    }
    info!("shut down");
    Ok(())
}

/// One-shot steps before the consumer starts. Nothing here is allowed to
/// stop the telemetry tap; every failure is logged and skipped.
fn run_startup_steps(service: ServiceConfig, startup: &StartupConfig) {
    let Some(device_id) = startup.device_id.as_deref() else {
        return; // config validation guarantees this for enabled steps
    };

    let http_timeout = startup.command_timeout + Duration::from_secs(5);
    let client = match ServiceClient::new(service, http_timeout) {
        Ok(client) => client,
        Err(e) => {
            warn!("hub service client unavailable: {e}");
            return;
        }
    };

    if let Some(site) = &startup.site {
        apply_site_metadata(&client, device_id, site);
    }
    if let Some(command) = &startup.command {
        dispatch_command(&client, device_id, command, startup.command_timeout);
    }
}

fn apply_site_metadata(client: &ServiceClient, device_id: &str, site: &SiteConfig) {
    let patch = service::twin_patch_body(&site.project, &site.site);
    let result = client
        .get_twin(device_id)
        .and_then(|twin| client.update_twin(&twin.device_id, &patch, &twin.etag));
    match result {
        Ok(()) => info!(
            "tagged {device_id} with project {} at site {}",
            site.project, site.site
        ),
        Err(e) => warn!("twin patch skipped: {e}"),
    }

    match client.query_device_ids(&service::site_query(&site.site), 100) {
        Ok(ids) => info!("devices at site {}: {}", site.site, ids.join(", ")),
        Err(e) => warn!("site query failed: {e}"),
    }
}

fn dispatch_command(
    client: &ServiceClient,
    device_id: &str,
    command: &CommandConfig,
    response_timeout: Duration,
) {
    match client.invoke_method(device_id, &command.method, &command.payload, response_timeout) {
        Ok(response) if response.status == 200 => {
            info!("direct method invoked: {}", response.payload)
        }
        Ok(response) => warn!(
            "direct method failed with status {}: {}",
            response.status, response.payload
        ),
        Err(e) => warn!("direct method failed: {e}"),
    }
}
