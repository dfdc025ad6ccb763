//! MQTT snapshot publishing for daemon mode.
//!
//! Each register is published under `<topic_prefix>/<register id>` with its
//! decoded value, plus a `/raw` subtopic carrying the undecoded integer for
//! diagnostics. An availability topic signals online/offline through a last
//! will message so consumers can tell a silent boiler from a dead daemon.

use anyhow::{Context, Result};
use kwb_heating_lib::poll::RegisterSnapshot;
use log::debug;
use paho_mqtt as mqtt;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

fn default_topic_prefix() -> String {
    String::from("kwb")
}

fn default_qos() -> u8 {
    0
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker URL, e.g. "tcp://192.168.1.10:1883".
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Quality of service code to use.
    #[serde(default = "default_qos")]
    qos: u8,
}

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "mqtt.yaml";

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read MQTT configuration {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Malformed MQTT configuration {}", path.display()))
    }

    pub fn qos(&self) -> i32 {
        assert!((0..=2).contains(&self.qos));
        self.qos as i32
    }

    fn availability_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }
}

pub struct Publisher {
    client: mqtt::AsyncClient,
    config: MqttConfig,
}

impl Publisher {
    /// Connect to the broker and announce availability.
    pub async fn connect(config: MqttConfig) -> Result<Self> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(&config.url)
            .finalize();
        let client =
            mqtt::AsyncClient::new(create_opts).with_context(|| "Error creating mqtt client")?;

        let mut builder = mqtt::ConnectOptionsBuilder::new();
        builder
            .keep_alive_interval(Duration::from_secs(20))
            .clean_session(true)
            .will_message(mqtt::Message::new_retained(
                config.availability_topic(),
                "offline",
                config.qos(),
            ));
        if let Some(username) = &config.username {
            builder.user_name(username);
        }
        if let Some(password) = &config.password {
            builder.password(password);
        }

        client
            .connect(builder.finalize())
            .await
            .with_context(|| format!("Mqtt client unable to connect to {}", config.url))?;

        let publisher = Publisher { client, config };
        publisher.publish_availability("online").await?;
        Ok(publisher)
    }

    async fn publish_availability(&self, state: &str) -> Result<()> {
        self.client
            .publish(mqtt::Message::new_retained(
                self.config.availability_topic(),
                state,
                self.config.qos(),
            ))
            .await
            .with_context(|| "Cannot publish availability")
    }

    /// Publish one snapshot. Stale registers keep publishing their last
    /// known value; staleness is exposed on a dedicated subtopic.
    pub async fn publish_snapshot(&self, snapshot: &RegisterSnapshot) -> Result<()> {
        for (id, entry) in snapshot.iter() {
            let topic = format!("{}/{}", self.config.topic_prefix, id);
            self.client
                .publish(mqtt::Message::new(
                    &topic,
                    entry.value.to_string(),
                    self.config.qos(),
                ))
                .await
                .with_context(|| format!("Cannot publish to {topic}"))?;
            self.client
                .publish(mqtt::Message::new(
                    format!("{topic}/raw"),
                    entry.raw.to_string(),
                    self.config.qos(),
                ))
                .await
                .with_context(|| format!("Cannot publish to {topic}/raw"))?;
            if entry.stale {
                self.client
                    .publish(mqtt::Message::new(
                        format!("{topic}/stale"),
                        "true",
                        self.config.qos(),
                    ))
                    .await
                    .with_context(|| format!("Cannot publish to {topic}/stale"))?;
            }
        }
        debug!(
            "published snapshot cycle {} ({} registers)",
            snapshot.cycle,
            snapshot.len()
        );
        Ok(())
    }

    /// Announce offline and disconnect cleanly.
    pub async fn shutdown(self) -> Result<()> {
        self.publish_availability("offline").await?;
        self.client
            .disconnect(None)
            .await
            .with_context(|| "Error disconnect mqtt client")?;
        Ok(())
    }
}
