//! In-memory index of protocol spec references.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gattkit_protocol::{SessionError, SessionKind, SessionResult, SpecId, SpecRef, SpecStore};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SpecRegistration {
    pub name: String,
    pub path: Option<String>,
    pub device_name: Option<String>,
    #[serde(default)]
    pub service_uuids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecEntry {
    pub spec_id: SpecId,
    pub name: String,
    pub path: Option<String>,
    pub device_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub registered_ts: DateTime<Utc>,
}

impl SpecEntry {
    pub fn reference(&self) -> SpecRef {
        SpecRef {
            spec_id: self.spec_id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SpecIndex {
    entries: RwLock<IndexMap<SpecId, SpecEntry>>,
}

impl SpecIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec. Re-registering the same name and path refreshes its hints and keeps its id.
    pub fn register(&self, registration: SpecRegistration) -> SessionResult<SpecEntry> {
        let name = registration.name.trim().to_owned();
        if name.is_empty() {
            return Err(SessionError::InvalidArgument("name is required".to_owned()));
        }
        let mut entries = self.entries.write();
        let existing = entries
            .values()
            .find(|e| e.name == name && e.path == registration.path)
            .map(|e| e.spec_id.clone());
        let spec_id = existing.unwrap_or_else(SpecId::generate);
        let entry = SpecEntry {
            spec_id: spec_id.clone(),
            name,
            path: registration.path,
            device_name: registration.device_name,
            service_uuids: registration.service_uuids,
            registered_ts: Utc::now(),
        };
        entries.insert(spec_id.clone(), entry.clone());
        info!(spec_id = %spec_id, name = %entry.name, "spec registered");
        Ok(entry)
    }

    pub fn list(&self) -> Vec<SpecEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn get(&self, spec_id: &SpecId) -> SessionResult<SpecEntry> {
        self.entries
            .read()
            .get(spec_id)
            .cloned()
            .ok_or_else(|| SessionError::not_found(SessionKind::Spec, spec_id))
    }
}

#[async_trait]
impl SpecStore for SpecIndex {
    async fn resolve(&self, spec_id: &SpecId) -> SessionResult<SpecRef> {
        self.get(spec_id).map(|entry| entry.reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkit_protocol::ErrorCode;

    fn thermo() -> SpecRegistration {
        SpecRegistration {
            name: "Thermometer protocol".into(),
            path: Some("specs/thermo.md".into()),
            device_name: Some("gattkit Thermometer".into()),
            service_uuids: vec![Uuid::from_u128(0x1809)],
        }
    }

    #[tokio::test]
    async fn registered_specs_resolve_to_references() {
        let index = SpecIndex::new();
        let entry = index.register(thermo()).unwrap();
        let reference = index.resolve(&entry.spec_id).await.unwrap();
        assert_eq!(reference.name, "Thermometer protocol");

        let err = index.resolve(&SpecId::from("missing")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn re_registering_keeps_the_id() {
        let index = SpecIndex::new();
        let first = index.register(thermo()).unwrap();
        let mut updated = thermo();
        updated.device_name = Some("Thermo v2".into());
        let second = index.register(updated).unwrap();
        assert_eq!(first.spec_id, second.spec_id);
        assert_eq!(index.list().len(), 1);
        assert_eq!(index.list()[0].device_name.as_deref(), Some("Thermo v2"));
    }

    #[test]
    fn blank_names_are_rejected() {
        let index = SpecIndex::new();
        let err = index
            .register(SpecRegistration {
                name: "  ".into(),
                ..SpecRegistration::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
