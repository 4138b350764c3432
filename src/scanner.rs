use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use btleplug::api::{BDAddr, Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt as _;
use log::{debug, info, warn};
use tokio::time::{Instant, MissedTickBehavior};

use crate::device::Device;
use crate::error::ProbeError;

/// Answers whether a device is currently reachable over the radio.
pub trait RadioProbe {
    /// Must resolve within `timeout`.
    fn probe(
        &self,
        address: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, ProbeError>>;
}

/// Outcome of probing one device in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub address: String,
    pub found: bool,
    /// Unix seconds when the probe finished.
    pub timestamp: u64,
}

/// Receives every scan result as soon as its probe completes.
pub trait ScanSink {
    fn on_result(&mut self, result: ScanResult) -> impl Future<Output = ()>;
}

pub struct ScanScheduler<P> {
    probe: P,
    interval: Duration,
    timeout: Duration,
}

impl<P: RadioProbe> ScanScheduler<P> {
    pub fn new(probe: P, interval: Duration, timeout: Duration) -> Self {
        if timeout > interval {
            warn!(
                "Scan timeout {:?} exceeds interval {:?}, capping to the interval",
                timeout, interval
            );
        }
        ScanScheduler {
            probe,
            interval,
            timeout: timeout.min(interval),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Scan forever. Cycle starts are spaced by the interval; a cycle that
    /// overruns is followed immediately by the next one.
    pub async fn run<S: ScanSink>(&self, devices: &[Device], sink: &mut S) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Scanning {} device(s) every {:?} (timeout {:?})",
            devices.len(),
            self.interval,
            self.timeout()
        );

        loop {
            ticker.tick().await;
            self.cycle(devices, sink).await;
        }
    }

    /// Probe every device once, in order.
    pub async fn cycle<S: ScanSink>(&self, devices: &[Device], sink: &mut S) {
        let started = Instant::now();
        for device in devices {
            let found = match self.probe.probe(device.address(), self.timeout).await {
                Ok(found) => found,
                Err(err) => {
                    warn!("Probe for {} failed: {}", device.name(), err);
                    false
                }
            };
            debug!("{} ({}) found: {}", device.name(), device.address(), found);
            sink.on_result(ScanResult {
                address: device.address().to_string(),
                found,
                timestamp: unix_now(),
            })
            .await;
        }
        debug!("Scan cycle took {:?}", started.elapsed());
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Probes by running a BLE scan until the address advertises or the timeout
/// passes.
pub struct BtleProbe {
    adapter: Adapter,
}

impl BtleProbe {
    pub fn new(adapter: Adapter) -> Self {
        BtleProbe { adapter }
    }

    /// Use the first Bluetooth adapter on the host.
    pub async fn first_adapter() -> Result<Self, ProbeError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(ProbeError::NotAvailable)?;
        info!("Using Bluetooth adapter {}", adapter.adapter_info().await?);
        Ok(BtleProbe::new(adapter))
    }

    async fn wait_for(&self, target: BDAddr) -> Result<bool, ProbeError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        while let Some(event) = events.next().await {
            let Some(id) = advertised_id(&event) else {
                continue;
            };
            let peripheral = self.adapter.peripheral(id).await?;
            if peripheral.address() == target {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl RadioProbe for BtleProbe {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<bool, ProbeError> {
        let target = match address.parse::<BDAddr>() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("Cannot probe {}: {}", address, err);
                return Ok(false);
            }
        };

        let result = tokio::time::timeout(timeout, self.wait_for(target)).await;

        if let Err(err) = self.adapter.stop_scan().await {
            debug!("Error stopping scan: {:?}", err);
        }

        match result {
            Ok(found) => found,
            Err(_elapsed) => Ok(false),
        }
    }
}

fn advertised_id(event: &CentralEvent) -> Option<&PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}
