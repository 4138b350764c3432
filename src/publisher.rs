use std::sync::Arc;

use log::{debug, error, info};
use serde_derive::Serialize;

use crate::device::{Device, DeviceResponse, DeviceType};
use crate::mqtt::{LinkStatus, MessageSink};

const PAYLOAD_HOME: &str = "home";
const PAYLOAD_AWAY: &str = "away";

/// Home Assistant MQTT discovery config for a presence binary sensor.
#[derive(Debug, Serialize)]
struct DiscoveryConfig<'a> {
    name: &'a str,
    unique_id: String,
    state_topic: String,
    json_attributes_topic: String,
    payload_on: &'static str,
    payload_off: &'static str,
    device_class: &'static str,
    availability_topic: &'a str,
    payload_available: &'static str,
    payload_not_available: &'static str,
    device: DiscoveryDevice<'a>,
}

#[derive(Debug, Serialize)]
struct DiscoveryDevice<'a> {
    identifiers: Vec<String>,
    name: &'a str,
    manufacturer: &'static str,
    model: &'static str,
    sw_version: &'static str,
}

#[derive(Debug, Serialize)]
struct Attributes<'a> {
    address: &'a str,
    source_type: DeviceType,
    last_seen: u64,
}

/// Turns state changes into retained discovery and state messages.
pub struct PresencePublisher<S> {
    sink: S,
    status: Arc<LinkStatus>,
    discovery_prefix: String,
    availability_topic: String,
    eligible: bool,
}

impl<S: MessageSink> PresencePublisher<S> {
    pub fn new(
        sink: S,
        status: Arc<LinkStatus>,
        discovery_prefix: &str,
        availability_topic: String,
    ) -> Self {
        PresencePublisher {
            sink,
            status,
            discovery_prefix: discovery_prefix.to_string(),
            availability_topic,
            eligible: false,
        }
    }

    /// True when publishing is worthwhile: connected, and Home Assistant is
    /// believed to be listening.
    pub fn can_publish(&self) -> bool {
        self.status.is_connected() && self.status.is_available()
    }

    /// Returns true exactly once each time publishing becomes possible again,
    /// so the caller can push current state that was not delivered meanwhile.
    pub fn became_eligible(&mut self) -> bool {
        let eligible = self.can_publish();
        let rising = eligible && !self.eligible;
        self.eligible = eligible;
        rising
    }

    /// Something was not delivered: report the next eligible check as a
    /// rising edge again.
    pub fn defer_resync(&mut self) {
        self.eligible = false;
    }

    fn topic(&self, device: &Device, leaf: &str) -> String {
        format!(
            "{}/binary_sensor/{}/{}",
            self.discovery_prefix,
            device.slug(),
            leaf
        )
    }

    fn discovery_payload(&self, device: &Device) -> String {
        let name = device.name();
        let config = DiscoveryConfig {
            name,
            unique_id: device.unique_id(),
            state_topic: self.topic(device, "state"),
            json_attributes_topic: self.topic(device, "attributes"),
            payload_on: PAYLOAD_HOME,
            payload_off: PAYLOAD_AWAY,
            device_class: "presence",
            availability_topic: &self.availability_topic,
            payload_available: "online",
            payload_not_available: "offline",
            device: DiscoveryDevice {
                identifiers: vec![device.unique_id()],
                name,
                manufacturer: "BlueTracker",
                model: "Bluetooth presence",
                sw_version: env!("CARGO_PKG_VERSION"),
            },
        };
        to_json(&config)
    }

    /// Publish discovery, then state and attributes, for one response.
    /// Returns whether the state message was handed to the broker.
    pub async fn publish(&self, response: &DeviceResponse) -> bool {
        let device = &response.device;
        let Some(state) = response.state.payload() else {
            return false;
        };
        if !self.status.is_connected() {
            debug!("Not connected, skipping update for {}", device.name());
            return false;
        }
        if !self.status.is_available() {
            debug!(
                "Home Assistant unavailable, skipping update for {}",
                device.name()
            );
            return false;
        }

        let attributes = Attributes {
            address: device.address(),
            source_type: device.kind(),
            last_seen: response.last_seen,
        };
        let messages = [
            (self.topic(device, "config"), self.discovery_payload(device)),
            (self.topic(device, "state"), state.to_string()),
            (
                self.topic(device, "attributes"),
                to_json(&attributes),
            ),
        ];

        for (topic, payload) in messages {
            if let Err(err) = self.sink.publish(&topic, payload, true).await {
                error!("Failed to publish {}: {}", topic, err);
                return false;
            }
        }

        info!("{} is {}", device.name(), state);
        true
    }
}

// Plain structs of strings and numbers always serialize.
fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
