//! MQTT publisher module
//!
//! Publishes register updates to MQTT broker with topics like:
//! `{prefix}/{device_id}/{register_name}`

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::store::RegisterUpdate;

/// MQTT Publisher for sending register values
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
    qos: QoS,
    retain: bool,
}

fn qos_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => {
            warn!("Invalid QoS level {}, using 1", level);
            QoS::AtLeastOnce
        }
    }
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    pub fn new(config: &MqttConfig) -> Self {
        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);

        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);
        Self::spawn_event_loop(eventloop, config.host.clone(), config.port);

        info!(
            "MQTT publisher initialized: {}:{} (prefix: {}, qos: {})",
            config.host, config.port, config.topic_prefix, config.qos
        );

        Self {
            client,
            topic_prefix: config.topic_prefix.clone(),
            qos: qos_level(config.qos),
            retain: config.retain,
        }
    }

    /// Spawn the MQTT event loop handler
    fn spawn_event_loop(mut eventloop: EventLoop, host: String, port: u16) {
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == rumqttc::ConnectReturnCode::Success {
                            info!("Connected to MQTT broker at {}:{}", host, port);
                        } else {
                            error!("MQTT connection rejected: {:?}", ack.code);
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Disconnected from MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    fn value_topic(&self, update: &RegisterUpdate) -> String {
        format!(
            "{}/{}/{}",
            self.topic_prefix, update.device_id, update.register_name
        )
    }

    fn status_topic(&self, device_id: &str) -> String {
        format!("{}/{}/status", self.topic_prefix, device_id)
    }

    /// Publish a register update from the broadcast channel
    pub async fn publish_update(&self, update: &RegisterUpdate) -> Result<()> {
        let topic = self.value_topic(update);

        let payload = serde_json::json!({
            "value": update.value,
            "status": update.status,
            "unit": update.unit,
            "timestamp": update.timestamp,
        });

        let payload_str =
            serde_json::to_string(&payload).with_context(|| "Failed to serialize payload")?;

        self.client
            .publish(&topic, self.qos, self.retain, payload_str.as_bytes())
            .await
            .with_context(|| format!("Failed to publish to {}", topic))?;

        debug!("MQTT published to {}: {}", topic, payload_str);

        Ok(())
    }

    /// Publish device status (online/offline), always retained
    pub async fn publish_status(&self, device_id: &str, online: bool) -> Result<()> {
        let topic = self.status_topic(device_id);
        let payload = if online { "online" } else { "offline" };

        self.client
            .publish(&topic, self.qos, true, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish status to {}", topic))?;

        info!("MQTT status: {} = {}", topic, payload);

        Ok(())
    }

    /// Start the MQTT publishing loop that listens to broadcast channel
    pub async fn start_publishing(
        self: Arc<Self>,
        mut update_rx: broadcast::Receiver<RegisterUpdate>,
    ) {
        info!("MQTT publishing loop started");

        loop {
            match update_rx.recv().await {
                Ok(update) => {
                    if let Err(e) = self.publish_update(&update).await {
                        error!("MQTT publish error: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT publisher lagged, missed {} updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("MQTT broadcast channel closed, stopping publisher");
                    break;
                }
            }
        }
    }
}
