//! Tracks whether Home Assistant is around to consume what we publish.
//!
//! The belief is seeded by an authenticated REST call each time the broker
//! connection comes up, then follows the retained `online`/`offline`
//! announcements Home Assistant makes on `<discovery_prefix>/status`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::mqtt::LinkStatus;

/// One-shot reachability check against the consumer.
pub trait ConsumerCheck {
    fn is_running(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Clone)]
pub struct HomeAssistantApi {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HomeAssistantApi {
    pub fn new(url: String, token: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(HomeAssistantApi {
            client,
            url,
            token: token.to_string(),
        })
    }
}

impl ConsumerCheck for HomeAssistantApi {
    async fn is_running(&self) -> bool {
        match self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("Home Assistant API answered {}", response.status());
                false
            }
            Err(err) => {
                warn!("Home Assistant API not reachable: {}", err);
                false
            }
        }
    }
}

pub struct AvailabilityMonitor<C> {
    check: C,
    status: Arc<LinkStatus>,
    status_topic: String,
}

impl<C: ConsumerCheck> AvailabilityMonitor<C> {
    pub fn new(check: C, status: Arc<LinkStatus>, discovery_prefix: &str) -> Self {
        AvailabilityMonitor {
            check,
            status,
            status_topic: format!("{discovery_prefix}/status"),
        }
    }

    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    /// Seed the belief after a (re)connect.
    pub async fn refresh(&self) {
        let online = self.check.is_running().await;
        info!("Home Assistant online: {}", online);
        self.status.set_available(online);
    }

    /// Follow status announcements. Returns whether the message was ours.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> bool {
        if topic != self.status_topic {
            return false;
        }
        let online = payload == b"online";
        debug!("Home Assistant online: {}", online);
        self.status.set_available(online);
        true
    }
}
