//! GATT catalog and notification types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Services and characteristics discovered on a connected device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub services: Vec<ServiceInfo>,
}

impl Catalog {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicInfo> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| &characteristic.uuid == uuid)
    }

    pub fn characteristic_count(&self) -> usize {
        self.services
            .iter()
            .map(|service| service.characteristics.len())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<u16>,
    /// Lowercase property names such as `read`, `write-without-response`, `notify`.
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub descriptors: Vec<DescriptorInfo>,
}

impl CharacteristicInfo {
    pub fn has_property(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorInfo {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<u16>,
}

/// A descriptor addressed through its owning characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorRef {
    pub characteristic: Uuid,
    pub descriptor: Uuid,
}

/// One payload pushed by a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub payload: Vec<u8>,
    pub ts: DateTime<Utc>,
}

impl Notification {
    pub fn now(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ts: Utc::now(),
        }
    }
}
