use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

use crate::transport::{MqttSettings, RetryPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8083,
            request_timeout_secs: 30,
            enable_cors: true,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ControllerConfig {
    #[validate(length(min = 1))]
    pub feeder_id: String,
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub loading_threshold: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub rated_capacity_kw: f64,
    pub reject_stale_measurements: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            feeder_id: "feeder-001".to_string(),
            interval_secs: 300,
            loading_threshold: 0.85,
            // Fixed until the feeder topology service provides ratings
            rated_capacity_kw: 1000.0,
            reject_stale_measurements: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Mqtt,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MqttConfig {
    pub kind: TransportKind,
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    #[validate(range(min = 1))]
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub retry_jitter_ms: u64,
    #[validate(range(min = 1))]
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Mqtt,
            host: "mqtt".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 60,
            retry_attempts: 10,
            retry_delay_secs: 2,
            retry_jitter_ms: 0,
            channel_capacity: 256,
        }
    }
}

impl MqttConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_secs(self.retry_delay_secs))
            .with_jitter(Duration::from_millis(self.retry_jitter_ms))
    }

    pub fn settings(&self, feeder_id: &str) -> MqttSettings {
        MqttSettings {
            host: self.host.clone(),
            port: self.port,
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| format!("der-ev-orchestrator-{feeder_id}")),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_figment(Self::figment())
    }

    /// Defaults, then `config/default.toml`, then `DER__SECTION__KEY`
    /// variables, then the flat variables the deployment manifests use.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("DER__").split("__"))
            .merge(Env::raw().only(&["FEEDER_ID"]).map(|_| "controller.feeder_id".into()))
            .merge(Env::raw().only(&["MQTT_BROKER"]).map(|_| "mqtt.host".into()))
            .merge(Env::raw().only(&["MQTT_PORT"]).map(|_| "mqtt.port".into()))
            .merge(Env::raw().only(&["MQTT_USERNAME"]).map(|_| "mqtt.username".into()))
            .merge(Env::raw().only(&["MQTT_PASSWORD"]).map(|_| "mqtt.password".into()))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract().context("invalid configuration")?;
        cfg.validate().context("configuration out of range")?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.controller.feeder_id, "feeder-001");
        assert_eq!(cfg.controller.interval_secs, 300);
        assert_eq!(cfg.controller.loading_threshold, 0.85);
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.retry_policy(), RetryPolicy::new(10, Duration::from_secs(2)));
    }

    #[test]
    fn test_threshold_must_be_in_unit_interval() {
        let mut cfg = Config::default();
        cfg.controller.loading_threshold = 0.0;
        assert!(cfg.validate().is_err());
        cfg.controller.loading_threshold = 1.0;
        assert!(cfg.validate().is_ok());
        cfg.controller.loading_threshold = 1.2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_client_id_defaults_to_feeder() {
        let cfg = MqttConfig::default();
        assert_eq!(cfg.settings("feeder-7").client_id, "der-ev-orchestrator-feeder-7");
    }
}
