//! Authoritative in-memory device registry.
//!
//! The registry is the single synchronization point for device state: one
//! `RwLock` guards the path→record map and the set of in-flight probe
//! markers. Every mutation goes through the status state machine; callers
//! that try to commit an illegal transition get an error back instead of
//! corrupting the map. External consumers only ever see deep copies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::trace;

use crate::device::{CameraDevice, DeviceStatus};
use crate::error::MonitorError;
use crate::stats::MonitorStats;

/// Outcome of a full-record commit, decided by structural comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    UpdatedMaterial,
    UpdatedTimestampOnly,
    Unchanged,
}

/// Outcome of claiming a probe slot for a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeginProbe {
    /// The path is now marked `Probing`; `prior` is the pre-claim status.
    Started { prior: Option<DeviceStatus> },
    /// Another probe already holds the path.
    AlreadyInFlight,
}

struct RegistryState {
    devices: HashMap<String, CameraDevice>,
    probing: HashSet<String>,
}

pub struct DeviceRegistry {
    state: RwLock<RegistryState>,
    stats: Arc<MonitorStats>,
}

/// Validity table for the status state machine. `None` is "absent".
fn transition_allowed(from: Option<DeviceStatus>, to: DeviceStatus) -> bool {
    use DeviceStatus::*;
    matches!(
        (from, to),
        (None, Probing)
            | (Some(Probing), Connected)
            | (Some(Probing), Error)
            | (Some(Connected), Disconnected)
            | (Some(Connected), Probing)
            | (Some(Error), Probing)
    )
}

impl DeviceRegistry {
    pub fn new(stats: Arc<MonitorStats>) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                devices: HashMap::new(),
                probing: HashSet::new(),
            }),
            stats,
        }
    }

    /// Deep copy of the whole map.
    pub async fn snapshot(&self) -> HashMap<String, CameraDevice> {
        self.state.read().await.devices.clone()
    }

    /// Deep copy of only the `Connected` records.
    pub async fn connected(&self) -> HashMap<String, CameraDevice> {
        self.state
            .read()
            .await
            .devices
            .iter()
            .filter(|(_, device)| device.status == DeviceStatus::Connected)
            .map(|(path, device)| (path.clone(), device.clone()))
            .collect()
    }

    pub async fn get(&self, path: &str) -> Option<CameraDevice> {
        self.state.read().await.devices.get(path).cloned()
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.state.read().await.devices.contains_key(path)
    }

    /// Claim the probe slot for `path` and mark it `Probing`.
    ///
    /// At most one probe per path can be in flight; a second claim reports
    /// `AlreadyInFlight` instead of racing. A `Disconnected` record that
    /// reappears is purged first so the claim runs absent→Probing.
    pub async fn begin_probe(&self, path: &str) -> Result<BeginProbe, MonitorError> {
        let mut state = self.state.write().await;
        if state.probing.contains(path) {
            return Ok(BeginProbe::AlreadyInFlight);
        }

        let mut prior = state.devices.get(path).map(|d| d.status);
        if prior == Some(DeviceStatus::Disconnected) {
            // Reappearance within the grace period: the stale record leaves
            // through "absent" before the fresh probe claims the path.
            state.devices.remove(path);
            prior = None;
        }

        if !transition_allowed(prior, DeviceStatus::Probing) {
            return Err(illegal(path, prior, DeviceStatus::Probing));
        }

        match state.devices.get_mut(path) {
            Some(device) => {
                device.status = DeviceStatus::Probing;
                device.last_seen = Utc::now();
            }
            None => {
                state.devices.insert(path.to_string(), CameraDevice::probing(path));
            }
        }
        state.probing.insert(path.to_string());
        self.refresh_gauges(&state);
        trace!(path, ?prior, "probe slot claimed");
        Ok(BeginProbe::Started { prior })
    }

    /// Release the probe marker for `path`.
    pub async fn finish_probe(&self, path: &str) {
        let mut state = self.state.write().await;
        state.probing.remove(path);
    }

    /// Undo a claimed probe that never produced a result (shutdown path).
    ///
    /// Restores the pre-claim status directly; the record would otherwise
    /// be stuck in `Probing` with no probe to resolve it.
    pub async fn revert_probe(&self, path: &str, prior: Option<DeviceStatus>) {
        let mut state = self.state.write().await;
        state.probing.remove(path);
        match prior {
            None => {
                state.devices.remove(path);
            }
            Some(status) => {
                if let Some(device) = state.devices.get_mut(path) {
                    device.status = status;
                }
            }
        }
        self.refresh_gauges(&state);
    }

    /// Commit a status-only transition under the state-machine rules.
    ///
    /// Returns the prior status on success.
    pub async fn apply_transition(
        &self,
        path: &str,
        to: DeviceStatus,
    ) -> Result<Option<DeviceStatus>, MonitorError> {
        let mut state = self.state.write().await;
        let prior = state.devices.get(path).map(|d| d.status);
        if !transition_allowed(prior, to) {
            return Err(illegal(path, prior, to));
        }
        match state.devices.get_mut(path) {
            Some(device) => {
                device.status = to;
                device.last_seen = Utc::now();
            }
            None => {
                state.devices.insert(path.to_string(), CameraDevice::probing(path));
            }
        }
        self.refresh_gauges(&state);
        Ok(prior)
    }

    /// Replace the record for a path, classifying the change structurally.
    ///
    /// Probe completions land here; the caller has already claimed the
    /// probe slot, so Probing→Connected/Error is implied by the record.
    pub async fn update_full(&self, record: CameraDevice) -> ChangeKind {
        let mut state = self.state.write().await;
        let kind = match state.devices.get(&record.path) {
            None => ChangeKind::Added,
            Some(prior) if !prior.same_shape(&record) => ChangeKind::UpdatedMaterial,
            Some(prior) if prior.last_seen != record.last_seen => ChangeKind::UpdatedTimestampOnly,
            Some(_) => ChangeKind::Unchanged,
        };
        state.devices.insert(record.path.clone(), record);
        self.refresh_gauges(&state);
        kind
    }

    /// Drop a record entirely (Disconnected → absent after grace).
    pub async fn remove(&self, path: &str) -> Option<CameraDevice> {
        let mut state = self.state.write().await;
        let removed = state.devices.remove(path);
        state.probing.remove(path);
        self.refresh_gauges(&state);
        removed
    }

    fn refresh_gauges(&self, state: &RegistryState) {
        let connected = state
            .devices
            .values()
            .filter(|d| d.status == DeviceStatus::Connected)
            .count();
        self.stats.set_device_gauges(connected, state.devices.len());
    }
}

fn illegal(path: &str, from: Option<DeviceStatus>, to: DeviceStatus) -> MonitorError {
    MonitorError::IllegalTransition {
        path: path.to_string(),
        from: from
            .map(|s| s.to_string())
            .unwrap_or_else(|| "ABSENT".to_string()),
        to: to.to_string(),
    }
}
