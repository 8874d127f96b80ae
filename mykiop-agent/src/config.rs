//! Configuration management
//!
//! Handles:
//! - Vehicle identity and timezone
//! - Remote store endpoints and timeouts
//! - MQTT broker, sensor and telemetry topics
//! - Reachability probe and housekeeping intervals
//! - Local storage and recording command

use crate::error::ConfigError;
use crate::media::Conversion;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "MYKIOP_AGENT_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub vehicle: VehicleConfig,
    pub remote: RemoteConfig,
    pub mqtt: MqttConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub device_id: String,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub database_url: String,
    pub storage_url: String,
    pub collection: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    /// Defaults to `mykiop/<device_id>/sensor`
    pub sensor_topic: Option<String>,
    pub telemetry_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Relative paths resolve against `data_dir`
    pub cache_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub day_check_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// argv with an optional `{path}` placeholder; empty disables recording
    pub record_command: Vec<String>,
    pub extension: String,
    /// argv with `{input}`/`{output}` placeholders run after each recording;
    /// empty uploads the raw capture
    pub convert_command: Vec<String>,
    pub converted_extension: String,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            device_id: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default(),
            timezone: "Australia/Melbourne".to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            database_url: "http://127.0.0.1:9000".to_string(),
            storage_url: "http://127.0.0.1:9199/upload".to_string(),
            collection: "bus_data".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            sensor_topic: None,
            telemetry_prefix: "bus_data".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_host: "www.google.com".to_string(),
            probe_port: 80,
            probe_timeout_secs: 3,
            poll_interval_secs: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./mykiop-data"),
            cache_file: PathBuf::from("data_cache.json"),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            day_check_interval_secs: 60,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            record_command: Vec::new(),
            extension: "h264".to_string(),
            convert_command: Vec::new(),
            converted_extension: "mp4".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load config from `$MYKIOP_AGENT_CONFIG` or the OS config directory.
    /// A missing file yields the defaults.
    pub async fn load() -> Result<Self, ConfigError> {
        let path = Self::config_file_path()?;
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to `path`, creating parent directories
    pub async fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(io)?;
        Ok(())
    }

    /// `$MYKIOP_AGENT_CONFIG`, else `<config dir>/mykiop-agent/config.toml`
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("mykiop-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vehicle.device_id.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceId);
        }
        self.timezone()?;

        let intervals = [
            ("remote.request_timeout_secs", self.remote.request_timeout_secs),
            ("network.probe_timeout_secs", self.network.probe_timeout_secs),
            ("network.poll_interval_secs", self.network.poll_interval_secs),
            ("schedule.day_check_interval_secs", self.schedule.day_check_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.vehicle
            .timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.vehicle.timezone.clone()))
    }

    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mykiop-agent-{}", self.vehicle.device_id))
    }

    pub fn sensor_topic(&self) -> String {
        self.mqtt
            .sensor_topic
            .clone()
            .unwrap_or_else(|| format!("mykiop/{}/sensor", self.vehicle.device_id))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.cache_file)
    }

    /// Where recordings of this vehicle are written
    pub fn media_dir(&self) -> PathBuf {
        self.storage.data_dir.join(&self.vehicle.device_id)
    }

    pub fn conversion(&self) -> Option<Conversion> {
        if self.media.convert_command.is_empty() {
            return None;
        }
        Some(Conversion {
            argv: self.media.convert_command.clone(),
            extension: self.media.converted_extension.clone(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.network.probe_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.network.poll_interval_secs)
    }

    pub fn day_check_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.day_check_interval_secs)
    }
}
