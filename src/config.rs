use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::device::{Device, DeviceType};
use crate::error::ConfigError;

/// Written next to the binary on first run.
pub const DEFAULT_CONFIG: &str = r#"# BlueTracker configuration

# "production" logs at info, "development" at debug. RUST_LOG overrides both.
environment = "production"

[mqtt]
host = "homeassistant.local"
port = 1883
username = "bluetracker"
password = "changeme"
# Long-lived access token from your Home Assistant profile page.
homeassistant_token = "changeme"
discovery_topic_prefix = "homeassistant"

[scan]
# Seconds between the start of two scan cycles.
scan_interval = 15
# Seconds to look for each device. Must not exceed scan_interval.
scan_timeout = 5
# Seconds a device must be unseen before it is marked away.
consider_away = 180

[[devices]]
name = "my phone"
mac = "00:00:00:00:00:00"
"#;

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub environment: Environment,
    pub mqtt: MqttConfig,
    pub scan: ScanConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub homeassistant_token: String,
    pub discovery_topic_prefix: Option<String>,
    pub homeassistant_url: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl MqttConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(1883)
    }

    pub fn discovery_prefix(&self) -> String {
        self.discovery_topic_prefix
            .clone()
            .unwrap_or_else(|| "homeassistant".to_string())
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("bluetracker_{}", hostname()))
    }

    /// Home Assistant REST API root used for the reachability check.
    pub fn homeassistant_url(&self) -> String {
        self.homeassistant_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:8123/api/", self.host))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds.unwrap_or(120))
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct ScanConfig {
    pub scan_interval: u64,
    pub scan_timeout: u64,
    pub consider_away: u64,
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout)
    }

    pub fn consider_away(&self) -> Duration {
        Duration::from_secs(self.consider_away)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub mac: MacAddress,
    #[serde(default, rename = "type")]
    pub kind: DeviceType,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::de::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.host", "must not be empty"));
        }
        if self.mqtt.homeassistant_token.trim().is_empty() {
            return Err(ConfigError::invalid(
                "mqtt.homeassistant_token",
                "must not be empty",
            ));
        }

        let scan = &self.scan;
        for (field, value) in [
            ("scan.scan_interval", scan.scan_interval),
            ("scan.scan_timeout", scan.scan_timeout),
            ("scan.consider_away", scan.consider_away),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be a positive number of seconds"));
            }
        }
        if scan.scan_timeout > scan.scan_interval {
            return Err(ConfigError::invalid(
                "scan.scan_timeout",
                format!(
                    "{}s exceeds scan_interval ({}s)",
                    scan.scan_timeout, scan.scan_interval
                ),
            ));
        }
        if scan.consider_away < scan.scan_interval {
            return Err(ConfigError::invalid(
                "scan.consider_away",
                format!(
                    "{}s is shorter than scan_interval ({}s)",
                    scan.consider_away, scan.scan_interval
                ),
            ));
        }

        if self.devices.is_empty() {
            return Err(ConfigError::invalid("devices", "at least one device is required"));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ConfigError::invalid("devices.name", "must not be empty"));
            }
            if !seen.insert(device.mac.bytes()) {
                return Err(ConfigError::invalid(
                    "devices.mac",
                    format!("{} is listed more than once", device.mac),
                ));
            }
        }
        Ok(())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|d| Device::new(&d.name, d.mac, d.kind))
            .collect()
    }
}

fn hostname() -> String {
    let name = gethostname::gethostname();
    match name.to_string_lossy().trim() {
        "" => "localhost".to_string(),
        name => name.to_string(),
    }
}
