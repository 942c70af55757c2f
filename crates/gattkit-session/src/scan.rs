//! Background discovery sessions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gattkit_protocol::{DeviceRecord, ScanFilter, ScanId};
use serde::Serialize;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    DeadlineElapsed,
    StreamEnded,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    Active,
    Stopped { reason: StopReason, at: DateTime<Utc> },
}

/// Devices seen by one scan. Stopping is terminal and freezes the device set.
#[derive(Debug)]
pub struct ScanSession {
    pub id: ScanId,
    pub filter: ScanFilter,
    pub timeout: Duration,
    pub started_at: DateTime<Utc>,
    state: ScanState,
    devices: HashMap<String, DeviceRecord>,
    task: Option<JoinHandle<()>>,
}

impl ScanSession {
    pub fn new(id: ScanId, filter: ScanFilter, timeout: Duration) -> Self {
        Self {
            id,
            filter,
            timeout,
            started_at: Utc::now(),
            state: ScanState::Active,
            devices: HashMap::new(),
            task: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ScanState::Active
    }

    /// Apply a sighting. Returns false when the scan has stopped or the filter rejects it.
    pub fn record(&mut self, mut device: DeviceRecord) -> bool {
        if !self.is_active() {
            return false;
        }
        if device.name.is_none() {
            device.name = self
                .devices
                .get(&device.address)
                .and_then(|previous| previous.name.clone());
        }
        if !self.filter.matches(&device) {
            return false;
        }
        self.devices.insert(device.address.clone(), device);
        true
    }

    /// Transition to stopped. Returns true only for the call that made the transition.
    pub fn stop(&mut self, reason: StopReason) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = ScanState::Stopped {
            reason,
            at: Utc::now(),
        };
        true
    }

    pub fn set_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }

    pub fn device(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices
            .values()
            .find(|device| device.address.eq_ignore_ascii_case(address))
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Devices ordered strongest signal first.
    pub fn snapshot(&self) -> ScanSnapshot {
        let mut devices: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.address.cmp(&b.address)));
        let stop_reason = match &self.state {
            ScanState::Active => None,
            ScanState::Stopped { reason, .. } => Some(*reason),
        };
        ScanSnapshot {
            scan_id: self.id.clone(),
            active: self.is_active(),
            devices,
            stop_reason,
        }
    }

    pub fn summary(&self) -> ScanSummary {
        ScanSummary {
            scan_id: self.id.clone(),
            active: self.is_active(),
            started_ts: self.started_at,
            timeout_s: self.timeout.as_secs_f64(),
            filter: self.filter.clone(),
            device_count: self.devices.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSnapshot {
    pub scan_id: ScanId,
    pub active: bool,
    pub devices: Vec<DeviceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub scan_id: ScanId,
    pub active: bool,
    pub started_ts: DateTime<Utc>,
    pub timeout_s: f64,
    #[serde(flatten)]
    pub filter: ScanFilter,
    pub device_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(filter: ScanFilter) -> ScanSession {
        ScanSession::new(ScanId::from("s1"), filter, Duration::from_secs(10))
    }

    #[test]
    fn repeated_sightings_update_in_place() {
        let mut scan = session(ScanFilter::default());
        scan.record(DeviceRecord::new("AA").with_name("Tag").with_rssi(-80));
        scan.record(DeviceRecord::new("AA").with_rssi(-50));
        let snapshot = scan.snapshot();
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].rssi, -50);
        assert_eq!(snapshot.devices[0].name.as_deref(), Some("Tag"));
    }

    #[test]
    fn stopped_scan_is_frozen() {
        let mut scan = session(ScanFilter::default());
        scan.record(DeviceRecord::new("AA"));
        assert!(scan.stop(StopReason::Requested));
        assert!(!scan.stop(StopReason::DeadlineElapsed));
        assert!(!scan.record(DeviceRecord::new("BB")));
        let snapshot = scan.snapshot();
        assert!(!snapshot.active);
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.stop_reason, Some(StopReason::Requested));
    }

    #[test]
    fn filter_rejects_non_matching_devices() {
        let mut scan = session(ScanFilter {
            name_filter: Some("band".into()),
            service_uuid: None,
        });
        assert!(!scan.record(DeviceRecord::new("AA").with_name("Scale")));
        assert!(scan.record(DeviceRecord::new("BB").with_name("FitBand")));
        assert_eq!(scan.device_count(), 1);
    }

    #[test]
    fn snapshot_orders_by_signal_strength() {
        let mut scan = session(ScanFilter::default());
        scan.record(DeviceRecord::new("AA").with_rssi(-90));
        scan.record(DeviceRecord::new("BB").with_rssi(-40));
        scan.record(DeviceRecord::new("CC").with_rssi(-60));
        let order: Vec<String> = scan
            .snapshot()
            .devices
            .into_iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(order, vec!["BB", "CC", "AA"]);
        assert!(scan.device("bb").is_some());
    }
}
