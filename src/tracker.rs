use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::availability::{AvailabilityMonitor, ConsumerCheck};
use crate::config::ScanConfig;
use crate::device::Device;
use crate::mqtt::{BrokerLink, LinkHooks, LinkStatus, MessageSink, MqttClient};
use crate::presence::DeviceRegistry;
use crate::publisher::PresencePublisher;
use crate::scanner::{RadioProbe, ScanResult, ScanScheduler, ScanSink, unix_now};

/// Scan-side half of the tracker: state machines plus the publisher.
pub struct Presence<S> {
    registry: DeviceRegistry,
    publisher: PresencePublisher<S>,
}

impl<S: MessageSink> Presence<S> {
    pub fn new(registry: DeviceRegistry, publisher: PresencePublisher<S>) -> Self {
        Presence {
            registry,
            publisher,
        }
    }

    /// Push the current state of every known device. Returns whether all of
    /// them were delivered.
    async fn resync(&self) -> bool {
        let known: Vec<_> = self.registry.known().collect();
        let mut count = 0;
        for response in &known {
            if self.publisher.publish(response).await {
                count += 1;
            }
        }
        debug!("Resynchronised {} of {} device(s)", count, known.len());
        count == known.len()
    }
}

impl<S: MessageSink> ScanSink for Presence<S> {
    async fn on_result(&mut self, result: ScanResult) {
        if self.publisher.became_eligible() {
            info!("Publishing enabled, resynchronising device states");
            if !self.resync().await {
                warn!("Resynchronisation incomplete, retrying on the next result");
                self.publisher.defer_resync();
            }
        }

        let Some(machine) = self.registry.get_mut(&result.address) else {
            warn!("Scan result for untracked address {}", result.address);
            return;
        };
        if let Some(response) = machine.evaluate(result.found, result.timestamp) {
            if !self.publisher.publish(&response).await {
                self.publisher.defer_resync();
            }
        }
    }
}

/// Broker-side half: reacts to connection events.
pub struct Session<C> {
    client: MqttClient,
    monitor: AvailabilityMonitor<C>,
}

impl<C: ConsumerCheck + Sync> LinkHooks for Session<C> {
    async fn on_connect(&self) {
        self.monitor.refresh().await;

        // Subscribing here renews the subscription after every reconnect.
        if let Err(err) = self.client.subscribe(self.monitor.status_topic()) {
            error!("Error subscribing to MQTT topics: {}", err);
        }
        if let Err(err) = self.client.announce_online() {
            error!("Error announcing availability: {}", err);
        }
    }

    fn on_disconnect(&self) {
        info!("MQTT session ended");
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if !self.monitor.on_message(topic, payload) {
            debug!("Ignoring message on {}", topic);
        }
    }
}

pub struct Tracker<P, C> {
    scheduler: ScanScheduler<P>,
    devices: Vec<Device>,
    scan: ScanConfig,
    client: MqttClient,
    eventloop: rumqttc::EventLoop,
    check: C,
    discovery_prefix: String,
}

impl<P, C> Tracker<P, C>
where
    P: RadioProbe,
    C: ConsumerCheck + Send + Sync + 'static,
{
    pub fn new(
        scan: ScanConfig,
        devices: Vec<Device>,
        probe: P,
        (client, eventloop): (MqttClient, rumqttc::EventLoop),
        check: C,
        discovery_prefix: String,
    ) -> Self {
        Tracker {
            scheduler: ScanScheduler::new(probe, scan.interval(), scan.timeout()),
            devices,
            scan,
            client,
            eventloop,
            check,
            discovery_prefix,
        }
    }

    /// Run until a termination signal or a fatal broker error.
    pub async fn run(self) -> anyhow::Result<()> {
        let Tracker {
            scheduler,
            devices,
            scan,
            client,
            mut eventloop,
            check,
            discovery_prefix,
        } = self;

        let status = Arc::new(LinkStatus::default());

        let session = Session {
            client: client.clone(),
            monitor: AvailabilityMonitor::new(check, status.clone(), &discovery_prefix),
        };
        let mut link = BrokerLink::new(status.clone());
        let mut link_task =
            tokio::spawn(async move { link.run(&mut eventloop, &session).await });

        let registry = DeviceRegistry::new(&devices, scan.consider_away(), unix_now());
        let publisher = PresencePublisher::new(
            client.clone(),
            status,
            &discovery_prefix,
            client.availability_topic(),
        );
        let mut presence = Presence::new(registry, publisher);
        info!("Tracking {} device(s)", presence.registry.len());

        let result = tokio::select! {
            _ = scheduler.run(&devices, &mut presence) => Ok(()),
            joined = &mut link_task => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(anyhow::Error::new(err)),
                Err(err) => Err(anyhow::Error::new(err).context("MQTT task failed")),
            },
            _ = shutdown_signal() => {
                info!("Shutting down");
                Ok(())
            }
        };

        if let Err(err) = client.disconnect() {
            debug!("Error disconnecting: {}", err);
        }
        if !link_task.is_finished()
            && tokio::time::timeout(Duration::from_secs(2), &mut link_task)
                .await
                .is_err()
        {
            link_task.abort();
        }

        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Error waiting for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Error installing SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use rumqttc::{ConnAck, ConnectReturnCode, ConnectionError, Event, Packet, Publish, QoS, Request};
    use tokio::sync::mpsc;

    use super::*;
    use crate::device::DeviceType;
    use crate::error::LinkError;
    use crate::mqtt::EventSource;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, String)>>,
        failing: AtomicBool,
    }

    impl Recorder {
        fn take(&self) -> Vec<(String, String)> {
            std::mem::take(&mut *self.messages.lock().unwrap())
        }
    }

    impl MessageSink for &Recorder {
        async fn publish(&self, topic: &str, payload: String, _retain: bool) -> Result<(), LinkError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LinkError::QueueFull(topic.to_string()));
            }
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    /// Hands messages to a bounded channel, waiting when it is full.
    struct QueueSink(mpsc::Sender<(String, String)>);

    impl MessageSink for QueueSink {
        async fn publish(&self, topic: &str, payload: String, _retain: bool) -> Result<(), LinkError> {
            let _ = self.0.send((topic.to_string(), payload)).await;
            Ok(())
        }
    }

    struct FixedCheck(bool);

    impl ConsumerCheck for FixedCheck {
        async fn is_running(&self) -> bool {
            self.0
        }
    }

    struct Script(VecDeque<Event>);

    impl EventSource for Script {
        async fn poll(&mut self) -> Result<Event, ConnectionError> {
            match self.0.pop_front() {
                Some(event) => Ok(event),
                None => std::future::pending().await,
            }
        }
    }

    const PHONE: &str = "aa:bb:cc:dd:ee:ff";

    fn presence(recorder: &Recorder, consider_away: u64) -> (Presence<&Recorder>, Arc<LinkStatus>) {
        let devices = [Device::new(
            "phone",
            PHONE.parse().unwrap(),
            DeviceType::Bluetooth,
        )];
        let status = Arc::new(LinkStatus::default());
        let registry = DeviceRegistry::new(&devices, Duration::from_secs(consider_away), 0);
        let publisher = PresencePublisher::new(
            recorder,
            status.clone(),
            "homeassistant",
            "bluetracker/status".to_string(),
        );
        (Presence::new(registry, publisher), status)
    }

    fn result(found: bool, timestamp: u64) -> ScanResult {
        ScanResult {
            address: PHONE.to_string(),
            found,
            timestamp,
        }
    }

    fn states(messages: &[(String, String)]) -> Vec<String> {
        messages
            .iter()
            .filter(|(topic, _)| topic.ends_with("/state"))
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_publishes_only_transitions() {
        let recorder = Recorder::default();
        let (mut presence, status) = presence(&recorder, 30);
        status.set_connected(true);
        status.set_available(true);

        for (found, t) in [(true, 0), (true, 10), (false, 20), (false, 30), (false, 40)] {
            presence.on_result(result(found, t)).await;
        }

        assert_eq!(states(&recorder.take()), vec!["home", "away"]);
    }

    #[tokio::test]
    async fn test_discovery_precedes_first_state() {
        let recorder = Recorder::default();
        let (mut presence, status) = presence(&recorder, 30);
        presence.on_result(result(true, 0)).await;
        status.set_connected(true);
        status.set_available(true);
        presence.on_result(result(true, 10)).await;

        let messages = recorder.take();
        let first_config = messages.iter().position(|(t, _)| t.ends_with("/config"));
        let first_state = messages.iter().position(|(t, _)| t.ends_with("/state"));
        assert!(first_config.unwrap() < first_state.unwrap());
    }

    #[tokio::test]
    async fn test_resyncs_current_state_after_reconnect() {
        let recorder = Recorder::default();
        let (mut presence, status) = presence(&recorder, 30);
        status.set_connected(true);
        status.set_available(true);
        presence.on_result(result(true, 0)).await;
        assert_eq!(states(&recorder.take()), vec!["home"]);

        // The away transition happens while the broker is unreachable.
        status.set_connected(false);
        presence.on_result(result(false, 30)).await;
        assert!(recorder.take().is_empty());

        status.set_connected(true);
        presence.on_result(result(false, 40)).await;
        assert_eq!(states(&recorder.take()), vec!["away"]);
    }

    #[tokio::test]
    async fn test_unknown_devices_are_not_resynced() {
        let recorder = Recorder::default();
        let (mut presence, status) = presence(&recorder, 60);
        status.set_connected(true);
        status.set_available(true);

        presence.on_result(result(false, 10)).await;
        presence.on_result(result(false, 20)).await;
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn test_untracked_address_is_ignored() {
        let recorder = Recorder::default();
        let (mut presence, status) = presence(&recorder, 30);
        status.set_connected(true);
        status.set_available(true);

        presence
            .on_result(ScanResult {
                address: "00:00:00:00:00:01".to_string(),
                found: true,
                timestamp: 0,
            })
            .await;
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_resync_is_retried() {
        let recorder = Recorder::default();
        let (mut presence, status) = presence(&recorder, 30);
        presence.on_result(result(true, 0)).await;

        status.set_connected(true);
        status.set_available(true);
        recorder.failing.store(true, Ordering::SeqCst);
        presence.on_result(result(true, 10)).await;
        assert!(recorder.take().is_empty());

        recorder.failing.store(false, Ordering::SeqCst);
        presence.on_result(result(true, 20)).await;
        assert_eq!(states(&recorder.take()), vec!["home"]);
    }

    #[tokio::test]
    async fn test_resync_waits_for_room_in_bounded_queue() {
        let (tx, mut rx) = mpsc::channel(10);
        let drain = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(message) = rx.recv().await {
                received.push(message);
            }
            received
        });

        let devices: Vec<Device> = (1..=5)
            .map(|i| {
                Device::new(
                    &format!("device {i}"),
                    format!("aa:bb:cc:dd:ee:0{i}").parse().unwrap(),
                    DeviceType::Bluetooth,
                )
            })
            .collect();
        let status = Arc::new(LinkStatus::default());
        let registry = DeviceRegistry::new(&devices, Duration::from_secs(30), 0);
        let publisher = PresencePublisher::new(
            QueueSink(tx),
            status.clone(),
            "homeassistant",
            "bluetracker/status".to_string(),
        );
        let mut presence = Presence::new(registry, publisher);

        // Every device is seen while publishing is not possible yet.
        for device in &devices {
            presence
                .on_result(ScanResult {
                    address: device.address().to_string(),
                    found: true,
                    timestamp: 0,
                })
                .await;
        }

        status.set_connected(true);
        status.set_available(true);
        presence
            .on_result(ScanResult {
                address: devices[0].address().to_string(),
                found: true,
                timestamp: 10,
            })
            .await;
        drop(presence);

        let received = drain.await.unwrap();
        assert_eq!(received.len(), 15);
        let mut state_topics: Vec<_> = received
            .iter()
            .filter(|(topic, _)| topic.ends_with("/state"))
            .map(|(topic, payload)| {
                assert_eq!(payload, "home");
                topic.as_str()
            })
            .collect();
        state_topics.sort();
        state_topics.dedup();
        assert_eq!(state_topics.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_sets_up_on_connect_and_follows_status() {
        let (tx, rx) = flume::bounded(10);
        let client = MqttClient::from_client(rumqttc::AsyncClient::from_senders(tx), "bluetracker_host");
        let status = Arc::new(LinkStatus::default());
        let session = Session {
            client,
            monitor: AvailabilityMonitor::new(FixedCheck(true), status.clone(), "homeassistant"),
        };
        let mut link = BrokerLink::new(status.clone());

        let mut events = Script(VecDeque::from([Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }))]));
        let _ = tokio::time::timeout(Duration::from_secs(1), link.run(&mut events, &session)).await;

        assert!(status.is_connected());
        assert!(status.is_available());

        let requests: Vec<Request> = rx.try_iter().collect();
        assert_eq!(requests.len(), 2);
        match &requests[0] {
            Request::Subscribe(subscribe) => {
                assert_eq!(subscribe.filters[0].path, "homeassistant/status");
            }
            other => panic!("expected a subscribe, got {other:?}"),
        }
        match &requests[1] {
            Request::Publish(publish) => {
                assert_eq!(publish.topic, "bluetracker_host/status");
                assert_eq!(&publish.payload[..], b"online");
                assert!(publish.retain);
            }
            other => panic!("expected a publish, got {other:?}"),
        }

        let mut events = Script(VecDeque::from([
            Event::Incoming(Packet::Publish(Publish::new(
                "homeassistant/status",
                QoS::AtLeastOnce,
                "offline",
            ))),
            Event::Incoming(Packet::Publish(Publish::new(
                "other/topic",
                QoS::AtLeastOnce,
                "online",
            ))),
        ]));
        let _ = tokio::time::timeout(Duration::from_secs(1), link.run(&mut events, &session)).await;
        assert!(!status.is_available());

        let mut events = Script(VecDeque::from([Event::Incoming(Packet::Publish(
            Publish::new("homeassistant/status", QoS::AtLeastOnce, "online"),
        ))]));
        let _ = tokio::time::timeout(Duration::from_secs(1), link.run(&mut events, &session)).await;
        assert!(status.is_available());
    }
}
