// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! MQTT link - telemetry publisher and command subscription

use std::time::Duration;

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::MqttConfig;
use crate::ingest::Command;

/// Connected MQTT client plus its topic layout.
///
/// Publishing is at-most-once (QoS 0): a failed or unreachable broker drops
/// the payload, it is never queued or retried. Incoming messages on the
/// `commands` topic are parsed and forwarded to the command ingestor.
pub struct MqttLink {
    client: AsyncClient,
    base_topic: String,
}

impl MqttLink {
    /// Connect and start the event loop task.
    ///
    /// Parsed commands are forwarded on `command_tx`; everything else the
    /// broker sends is logged and dropped.
    pub async fn connect(config: &MqttConfig, command_tx: mpsc::Sender<Command>) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        let command_topic = format!("{}/commands", config.base_topic);
        client
            .subscribe(&command_topic, QoS::AtMostOnce)
            .await
            .map_err(|e| anyhow!("MQTT subscribe failed: {}", e))?;

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == command_topic {
                            match serde_json::from_slice::<Command>(&msg.payload) {
                                Ok(cmd) => {
                                    if command_tx.send(cmd).await.is_err() {
                                        // Ingestor gone; engine is shutting down
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!("unparseable command message: {}", e);
                                }
                            }
                        } else {
                            debug!("MQTT received on {:?}", msg.topic);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!(
            "MQTT link initialized for {}:{}, base topic '{}'",
            config.broker, config.port, config.base_topic
        );

        Ok(Self {
            client,
            base_topic: config.base_topic.clone(),
        })
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.base_topic, suffix)
    }

    /// Publish a JSON payload under the base topic, best effort.
    pub async fn publish<T: Serialize>(&self, suffix: &str, payload: &T) -> Result<()> {
        let json = serde_json::to_vec(payload)?;
        self.client
            .publish(self.topic(suffix), QoS::AtMostOnce, false, json)
            .await
            .map_err(|e| anyhow!("MQTT publish failed: {}", e))?;
        Ok(())
    }

    /// Publish a single channel value under `channels/<name>`.
    pub async fn publish_value(&self, channel: &str, value: f64) -> Result<()> {
        self.publish(
            &format!("channels/{}", channel),
            &serde_json::json!({ "channel": channel, "value": value }),
        )
        .await
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| anyhow!("MQTT disconnect failed: {}", e))?;
        Ok(())
    }
}
