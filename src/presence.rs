//! Debounced home/away tracking for a single device.
//!
//! A device is `Home` as soon as one probe finds it. It only becomes `Away`
//! once it has gone unseen for `consider_away` seconds, measured from the last
//! successful probe (or from when tracking started, for a device that has
//! never been seen). The boundary is inclusive: exactly `consider_away` seconds
//! of absence is enough.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;

use crate::device::{Device, DeviceResponse, DeviceState};

#[derive(Debug)]
pub struct DeviceStateMachine {
    device: Device,
    state: DeviceState,
    last_seen: u64,
    consider_away: u64,
}

impl DeviceStateMachine {
    /// `started_at` seeds the absence window so that a device which is never
    /// found still settles on `Away` after `consider_away`.
    pub fn new(device: Device, consider_away: Duration, started_at: u64) -> Self {
        DeviceStateMachine {
            device,
            state: DeviceState::Unknown,
            last_seen: started_at,
            consider_away: consider_away.as_secs(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Feed one probe result. Returns a response only when the state changed.
    pub fn evaluate(&mut self, found: bool, now: u64) -> Option<DeviceResponse> {
        let next = if found {
            self.last_seen = self.last_seen.max(now);
            DeviceState::Home
        } else if now.saturating_sub(self.last_seen) >= self.consider_away {
            DeviceState::Away
        } else {
            debug!(
                "{} not seen for {}s, within grace period",
                self.device.name(),
                now.saturating_sub(self.last_seen)
            );
            return None;
        };

        if next == self.state {
            return None;
        }

        debug!("{}: {} -> {}", self.device.name(), self.state, next);
        self.state = next;
        Some(self.snapshot())
    }

    /// Current state as a response, regardless of whether it just changed.
    pub fn snapshot(&self) -> DeviceResponse {
        DeviceResponse {
            device: self.device.clone(),
            state: self.state,
            last_seen: self.last_seen,
        }
    }
}

/// All tracked devices, keyed by address. One machine per address for the
/// lifetime of the process.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    machines: HashMap<String, DeviceStateMachine>,
}

impl DeviceRegistry {
    pub fn new(devices: &[Device], consider_away: Duration, started_at: u64) -> Self {
        let machines = devices
            .iter()
            .map(|device| {
                (
                    device.address().to_string(),
                    DeviceStateMachine::new(device.clone(), consider_away, started_at),
                )
            })
            .collect();
        DeviceRegistry { machines }
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut DeviceStateMachine> {
        self.machines.get_mut(address)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Responses for every device whose state has been determined.
    pub fn known(&self) -> impl Iterator<Item = DeviceResponse> + '_ {
        self.machines
            .values()
            .filter(|m| m.state() != DeviceState::Unknown)
            .map(DeviceStateMachine::snapshot)
    }
}
