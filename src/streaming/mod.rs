// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Streaming module - MQTT telemetry out, commands in

mod mqtt;

pub use mqtt::MqttLink;

use serde::{Deserialize, Serialize};

/// Message bus connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Enable the MQTT link
    pub enabled: bool,
    /// Broker hostname or address
    pub broker: String,
    /// Broker port
    pub port: u16,
    /// Client identifier
    pub client_id: String,
    /// Topic prefix for everything this engine publishes and consumes
    pub base_topic: String,
    /// Optional username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "ironloop".to_string(),
            base_topic: "ironloop".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
        }
    }
}
