use std::fmt;

use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

/// The radio a device is tracked over. Only classic/LE Bluetooth today.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Bluetooth,
}

/// A tracked device, created once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: String,
    address: String,
    kind: DeviceType,
}

impl Device {
    pub fn new(name: &str, address: MacAddress, kind: DeviceType) -> Self {
        Device {
            name: title_case(name),
            address: address.to_string().to_lowercase(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercase, colon separated MAC address. Unique per tracked device.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> DeviceType {
        self.kind
    }

    /// Topic-safe identifier derived from the display name.
    pub fn slug(&self) -> String {
        sanitize_name(&self.name)
    }

    /// Stable identifier for Home Assistant, derived from the address so a
    /// rename does not orphan the entity.
    pub fn unique_id(&self) -> String {
        format!("bluetracker_{}", self.address.replace(':', ""))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Unknown,
    Home,
    Away,
}

impl DeviceState {
    /// MQTT payload for the state topic. `None` while nothing is known yet.
    pub fn payload(self) -> Option<&'static str> {
        match self {
            DeviceState::Unknown => None,
            DeviceState::Home => Some("home"),
            DeviceState::Away => Some("away"),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload().unwrap_or("unknown"))
    }
}

/// Emitted by a state machine whenever its device changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResponse {
    pub device: Device,
    pub state: DeviceState,
    /// Unix seconds of the last probe that found the device.
    pub last_seen: u64,
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut word_start = true;
    for c in name.chars() {
        if c.is_alphabetic() {
            if word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            word_start = false;
        } else {
            out.push(c);
            word_start = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Device 123";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "test_s_device_123");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("john's PHONE"), "John'S Phone");
        assert_eq!(title_case("pixel-7 pro"), "Pixel-7 Pro");
    }

    #[test]
    fn test_device_normalizes_address() {
        let device = Device::new("phone", mac("AA:BB:CC:DD:EE:0F"), DeviceType::Bluetooth);
        assert_eq!(device.address(), "aa:bb:cc:dd:ee:0f");
        assert_eq!(device.name(), "Phone");
        assert_eq!(device.unique_id(), "bluetracker_aabbccddee0f");
        assert_eq!(device.slug(), "phone");
        assert_eq!(device.kind(), DeviceType::Bluetooth);
    }

    #[test]
    fn test_state_payload() {
        assert_eq!(DeviceState::Home.payload(), Some("home"));
        assert_eq!(DeviceState::Away.payload(), Some("away"));
        assert_eq!(DeviceState::Unknown.payload(), None);
        assert_eq!(DeviceState::Unknown.to_string(), "unknown");
    }
}
