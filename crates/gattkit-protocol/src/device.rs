//! Advertisement records and scan filters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bytes::HexBytes;

/// Signal strength reported when the advertiser gave none.
pub const RSSI_UNKNOWN: i16 = -127;

/// One device as last seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_rssi")]
    pub rssi: i16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<i16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_uuids: Vec<Uuid>,
    /// Vendor data keyed by company identifier.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manufacturer_data: BTreeMap<u16, HexBytes>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_data: BTreeMap<Uuid, HexBytes>,
}

fn default_rssi() -> i16 {
    RSSI_UNKNOWN
}

impl DeviceRecord {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: RSSI_UNKNOWN,
            tx_power: None,
            service_uuids: Vec::new(),
            manufacturer_data: BTreeMap::new(),
            service_data: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        if !self.service_uuids.contains(&service) {
            self.service_uuids.push(service);
        }
        self
    }
}

/// Optional narrowing applied to scan results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_uuid: Option<Uuid>,
}

impl ScanFilter {
    /// Case-insensitive name substring and advertised-service membership.
    pub fn matches(&self, device: &DeviceRecord) -> bool {
        if let Some(needle) = self.name_filter.as_deref().filter(|n| !n.is_empty()) {
            let Some(name) = device.name.as_deref() else {
                return false;
            };
            if !name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        match self.service_uuid {
            Some(service) => device.service_uuids.contains(&service),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_uuid::parse_ble_uuid;

    #[test]
    fn empty_filter_matches_everything() {
        assert!(ScanFilter::default().matches(&DeviceRecord::new("AA:BB")));
    }

    #[test]
    fn name_filter_is_case_insensitive_substring() {
        let filter = ScanFilter {
            name_filter: Some("therm".into()),
            service_uuid: None,
        };
        assert!(filter.matches(&DeviceRecord::new("a").with_name("Kitchen THERMometer")));
        assert!(!filter.matches(&DeviceRecord::new("b").with_name("Scale")));
        assert!(!filter.matches(&DeviceRecord::new("c")));
    }

    #[test]
    fn service_filter_requires_advertised_service() {
        let heart_rate = parse_ble_uuid("180d").unwrap();
        let filter = ScanFilter {
            name_filter: None,
            service_uuid: Some(heart_rate),
        };
        assert!(filter.matches(&DeviceRecord::new("a").with_service(heart_rate)));
        assert!(!filter.matches(&DeviceRecord::new("b")));
    }

    #[test]
    fn record_json_omits_empty_advertisement_fields() {
        let json = serde_json::to_value(DeviceRecord::new("AA").with_rssi(-40)).unwrap();
        assert_eq!(json["address"], "AA");
        assert_eq!(json["rssi"], -40);
        assert!(json.get("service_uuids").is_none());
        assert!(json.get("manufacturer_data").is_none());
    }
}
