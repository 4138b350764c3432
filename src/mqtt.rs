use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{ConnectionError, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};

use crate::backoff::Backoff;
use crate::config;
use crate::error::LinkError;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

/// Longest the scan loop waits for room in the client's request queue.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Flags shared between the broker task (writer) and the scan loop (reader).
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
    available: AtomicBool,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether Home Assistant is believed to be listening.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }
}

/// Where outgoing messages go. Publishing waits for the message to be queued.
pub trait MessageSink {
    fn publish(
        &self,
        topic: &str,
        payload: String,
        retain: bool,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    client_id: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let client_id = config.client_id();

        let mut mqttoptions = MqttOptions::new(client_id.clone(), config.host.clone(), config.port());

        mqttoptions.set_keep_alive(config.keep_alive());
        mqttoptions.set_clean_session(true);
        mqttoptions.set_last_will(LastWill::new(
            availability_topic(&client_id),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (MqttClient { client, client_id }, eventloop)
    }

    #[cfg(test)]
    pub fn from_client(client: rumqttc::AsyncClient, client_id: &str) -> Self {
        MqttClient {
            client,
            client_id: client_id.to_string(),
        }
    }

    /// `<client_id>/status`, carrying our own online/offline state.
    pub fn availability_topic(&self) -> String {
        availability_topic(&self.client_id)
    }

    pub fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        debug!("Subscribing to {}", topic);
        self.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        Ok(())
    }

    /// Counterpart of the last will, sent on every successful connect.
    ///
    /// Runs on the broker task, which is the only consumer of the request
    /// queue, so it must not wait for room.
    pub fn announce_online(&self) -> Result<(), LinkError> {
        self.client.try_publish(
            self.availability_topic(),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_ONLINE,
        )?;
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), LinkError> {
        debug!("Disconnecting MQTT client");
        self.client.try_disconnect()?;
        Ok(())
    }
}

impl MessageSink for MqttClient {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), LinkError> {
        tokio::time::timeout(
            PUBLISH_TIMEOUT,
            self.client.publish(topic, QoS::AtLeastOnce, retain, payload),
        )
        .await
        .map_err(|_| LinkError::QueueFull(topic.to_string()))??;
        debug!("Published {}", topic);
        Ok(())
    }
}

fn availability_topic(client_id: &str) -> String {
    format!("{client_id}/status")
}

/// Source of broker events; `rumqttc::EventLoop` in production.
pub trait EventSource {
    fn poll(&mut self) -> impl Future<Output = Result<Event, ConnectionError>> + Send;
}

impl EventSource for rumqttc::EventLoop {
    async fn poll(&mut self) -> Result<Event, ConnectionError> {
        rumqttc::EventLoop::poll(self).await
    }
}

/// Named hooks the broker link drives. Called from the broker task only.
pub trait LinkHooks {
    fn on_connect(&self) -> impl Future<Output = ()> + Send;
    fn on_disconnect(&self);
    fn on_message(&self, topic: &str, payload: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The broker may come up later.
    Transient,
    /// Misconfiguration; retrying will not help.
    Fatal,
}

/// Timeouts and refused connections are worth retrying. Name resolution
/// failures, broker rejections and anything else are not.
pub fn classify(err: &ConnectionError) -> ConnectFailure {
    match err {
        ConnectionError::NetworkTimeout => ConnectFailure::Transient,
        ConnectionError::Io(err) => match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused => {
                ConnectFailure::Transient
            }
            _ => ConnectFailure::Fatal,
        },
        _ => ConnectFailure::Fatal,
    }
}

/// Connection state machine around the MQTT event loop.
///
/// rumqttc reconnects on the next poll after an error; this type decides how
/// long to wait first and whether to give up. Failures are only ever fatal
/// before the first successful connection: once the broker has been reached
/// the configuration is known good and every later failure is retried.
#[derive(Debug)]
pub struct BrokerLink {
    state: ConnectionState,
    backoff: Backoff,
    ever_connected: bool,
    status: Arc<LinkStatus>,
}

impl BrokerLink {
    pub fn new(status: Arc<LinkStatus>) -> Self {
        BrokerLink {
            state: ConnectionState::Disconnected,
            backoff: Backoff::default(),
            ever_connected: false,
            status,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.ever_connected = true;
        self.backoff.reset();
    }

    /// Returns the delay before the next attempt, or an error if the failure
    /// is fatal.
    fn on_error(&mut self, err: ConnectionError) -> Result<Duration, LinkError> {
        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Disconnected;
        self.status.set_connected(false);
        self.status.set_available(false);

        if was_connected {
            warn!("Lost connection to MQTT broker: {}", err);
        } else if !self.ever_connected && classify(&err) == ConnectFailure::Fatal {
            error!("Failed to connect to MQTT broker: {}", err);
            return Err(LinkError::Fatal(err));
        } else {
            warn!("Failed to connect to MQTT broker: {}", err);
        }

        let delay = self.backoff.next_delay();
        warn!("Retrying in {} seconds", delay.as_secs());
        self.state = ConnectionState::Connecting;
        Ok(delay)
    }

    /// Drive the event loop until the client disconnects or a fatal error
    /// occurs.
    pub async fn run<E, H>(&mut self, events: &mut E, hooks: &H) -> Result<(), LinkError>
    where
        E: EventSource,
        H: LinkHooks + Sync,
    {
        info!("Connecting to MQTT broker...");
        self.state = ConnectionState::Connecting;

        loop {
            match events.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    self.on_connected();
                    hooks.on_connect().await;
                    // Session requests are queued before the scan loop may publish.
                    self.status.set_connected(true);
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);
                    hooks.on_message(&p.topic, &p.payload);
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("Subscription acknowledged");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                    self.state = ConnectionState::Disconnected;
                    self.status.set_connected(false);
                    hooks.on_disconnect();
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => {
                    let was_connected = self.state() == ConnectionState::Connected;
                    let delay = self.on_error(err)?;
                    if was_connected {
                        hooks.on_disconnect();
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
