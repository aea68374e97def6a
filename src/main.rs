use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modpoller::api::{self, AppState};
use modpoller::config::load_config;
use modpoller::mqtt::MqttPublisher;
use modpoller::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    info!("modpoller starting with {} devices", config.devices.len());

    let metrics = if config.server.metrics_enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .with_context(|| "Failed to install metrics recorder")?;
        Some(handle)
    } else {
        None
    };

    let (updates, _) = broadcast::channel(1024);
    let gateway = Arc::new(Gateway::new(updates));

    let publisher = config.mqtt.as_ref().map(|mqtt| Arc::new(MqttPublisher::new(mqtt)));
    if let Some(publisher) = &publisher {
        tokio::spawn(publisher.clone().start_publishing(gateway.subscribe()));
    }

    for device in &config.devices {
        match gateway.connect_device(device, &config.polling).await {
            Ok(()) => {
                if let Some(publisher) = &publisher {
                    if let Err(e) = publisher.publish_status(&device.id, true).await {
                        warn!("{}", e);
                    }
                }
            }
            Err(e) => error!("Device {} not started: {:#}", device.id, e),
        }
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("API server listening on http://{}", addr);

    let app = api::router(AppState {
        gateway: gateway.clone(),
        metrics,
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .with_context(|| "API server failed")?;

    info!("Shutting down");
    let ids = gateway.device_ids().await;
    gateway.shutdown().await;
    if let Some(publisher) = &publisher {
        for id in ids {
            if let Err(e) = publisher.publish_status(&id, false).await {
                warn!("{}", e);
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
