use std::io;
use std::path::PathBuf;

/// Errors raised while reading or validating the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from a single radio probe. Never fatal: the scanner treats them as
/// "not found" for that device and cycle.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no Bluetooth adapter available")]
    NotAvailable,

    #[error("Bluetooth error")]
    Radio(#[from] btleplug::Error),
}

/// Errors from the broker link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A request could not be queued on the MQTT client.
    #[error("MQTT client error")]
    Client(#[from] rumqttc::ClientError),

    /// The request queue stayed full for too long.
    #[error("timed out queueing a message for {0}")]
    QueueFull(String),

    /// The broker cannot be reached and retrying will not help.
    #[error("fatal MQTT connection error: {0}")]
    Fatal(#[source] rumqttc::ConnectionError),
}
