//! Policy types: capability tokens and policy sets.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A capability token naming one permitted device operation.
///
/// Tokens look like `"ble:write:<uuid>"`; a trailing `*` in a policy pattern
/// matches any suffix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Capability(pub String);

impl Capability {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn read(characteristic: &Uuid) -> Self {
        Self(format!("ble:read:{characteristic}"))
    }

    pub fn write(characteristic: &Uuid) -> Self {
        Self(format!("ble:write:{characteristic}"))
    }

    pub fn subscribe(characteristic: &Uuid) -> Self {
        Self(format!("ble:subscribe:{characteristic}"))
    }

    pub fn read_descriptor(descriptor: &Uuid) -> Self {
        Self(format!("ble:read_descriptor:{descriptor}"))
    }

    pub fn write_descriptor(descriptor: &Uuid) -> Self {
        Self(format!("ble:write_descriptor:{descriptor}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this token, read as a pattern, covers `actual`.
    pub fn matches(&self, actual: &Capability) -> bool {
        let pattern = self.as_str();
        if pattern.ends_with('*') {
            let prefix = pattern.trim_end_matches('*');
            prefix.is_empty() || actual.as_str().starts_with(prefix)
        } else {
            pattern == actual.as_str()
        }
    }
}

/// The capabilities a kernel instance grants its controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    pub allow_capabilities: Vec<Capability>,
}

impl PolicySet {
    /// Writes are denied unless enabled. An allowlist narrows characteristic
    /// writes; descriptor writes only need writes enabled.
    pub fn from_write_settings(allow_writes: bool, allowlist: Option<&[Uuid]>) -> Self {
        let mut policy = Self::default();
        if !allow_writes {
            return policy;
        }
        match allowlist {
            Some(uuids) => policy
                .allow_capabilities
                .extend(uuids.iter().map(Capability::write)),
            None => policy.allow_capabilities.push(Capability::new("ble:write:*")),
        }
        policy
            .allow_capabilities
            .push(Capability::new("ble:write_descriptor:*"));
        policy
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            allow_capabilities: vec![
                Capability::new("ble:read:*"),
                Capability::new("ble:subscribe:*"),
                Capability::new("ble:read_descriptor:*"),
                Capability::new("ble:discover"),
            ],
        }
    }
}
