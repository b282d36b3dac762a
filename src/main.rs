use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hive_connector::config::{ApplicationType, Config};
use hive_connector::downlink::{DownlinkFlavor, DownlinkProcessor};
use hive_connector::formatter::{
    BlobStoreSource, FileSystemSource, FormatterCache, FormatterResolver, FormatterSource,
};
use hive_connector::hive::{HiveApi, HiveClient};
use hive_connector::iot::{
    ConnectionStrategy, DeviceConnectionCache, InboundMessageHandler, MqttConnectionFactory,
};
use hive_connector::queue::{UplinkQueue, UplinkQueueWorker};
use hive_connector::startup::StartupService;
use hive_connector::uplink::UplinkProcessor;
use hive_connector::webhook::{self, WebhookState};

#[derive(Parser)]
#[command(name = "hive-connector")]
#[command(about = "Relays satellite hive uplinks and downlinks to IoT Hub or IoT Central")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("hive-connector v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Application type {:?}, organisation {}",
        config.iot.application_type, config.application.organisation_id
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.iot.transport_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let source: Arc<dyn FormatterSource> = match &config.formatters.blob {
        Some(blob) => {
            info!("Formatters from blob container {}", blob.container_url);
            Arc::new(BlobStoreSource::new(
                http.clone(),
                blob,
                &config.formatters.extension,
            ))
        }
        None => {
            info!(
                "Formatters from {:?} and {:?}",
                config.formatters.uplink_path, config.formatters.downlink_path
            );
            Arc::new(FileSystemSource::new(&config.formatters))
        }
    };
    let formatters = Arc::new(FormatterCache::new(FormatterResolver::new(source)));

    let hive: Arc<dyn HiveApi> = Arc::new(HiveClient::new(config.hive.clone(), http.clone()));

    let flavor = match config.iot.application_type {
        ApplicationType::Hub => DownlinkFlavor::Hub,
        ApplicationType::Central => DownlinkFlavor::Central {
            methods: config
                .iot
                .central
                .as_ref()
                .map(|central| central.methods.clone())
                .unwrap_or_default(),
        },
    };
    let downlink: Arc<dyn InboundMessageHandler> = Arc::new(DownlinkProcessor::new(
        flavor,
        config.application.clone(),
        Arc::clone(&formatters),
        Arc::clone(&hive),
    ));

    let (strategy, model_id) = ConnectionStrategy::from_config(&config.iot, http.clone())?;
    let factory = Arc::new(MqttConnectionFactory::new(
        strategy,
        model_id,
        downlink,
        Duration::from_secs(config.iot.transport_timeout_secs),
    ));
    let connections = Arc::new(DeviceConnectionCache::new(factory));

    let cancel = CancellationToken::new();

    // Uplink: webhook -> queue -> worker -> hub
    let (queue, receiver) =
        UplinkQueue::new(&config.webhook.queue_name, config.webhook.queue_capacity);
    let processor = Arc::new(UplinkProcessor::new(
        Arc::clone(&formatters),
        Arc::clone(&connections),
    ));
    let worker = UplinkQueueWorker::new(queue.clone(), receiver, processor, &config.queue);
    let worker_handle = tokio::spawn(worker.run(cancel.clone()));

    let webhook_state = WebhookState::new(&config, queue);
    let bind = config.webhook.bind.clone();
    let webhook_cancel = cancel.clone();
    let webhook_handle = tokio::spawn(async move {
        if let Err(e) = webhook::serve(&bind, webhook_state, webhook_cancel.clone()).await {
            error!("Webhook failed: {:#}", e);
            webhook_cancel.cancel();
        }
    });

    let startup = StartupService::new(
        Arc::clone(&hive),
        Arc::clone(&connections),
        config.application.organisation_id,
        config.startup.prewarm_connections,
    );
    let startup_cancel = cancel.clone();
    tokio::spawn(async move {
        match startup.run(startup_cancel).await {
            Ok(opened) => info!("Start-up complete, {} connections pre-warmed", opened),
            // Sends log in again on demand
            Err(e) => warn!("Start-up failed: {}", e),
        }
    });

    info!("Connector running. Press Ctrl+C to stop.");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down...");
        }
        _ = cancel.cancelled() => {
            warn!("Shutting down after task failure");
        }
    }
    cancel.cancel();

    if let Err(e) = webhook_handle.await {
        error!("Webhook task panicked: {}", e);
    }
    if let Err(e) = worker_handle.await {
        error!("Uplink worker panicked: {}", e);
    }

    Ok(())
}
