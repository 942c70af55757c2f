//! Capability evaluation for device operations.
//!
//! Read-only operations are granted by the default policy; writes must be
//! enabled explicitly and can be narrowed to an allowlist of characteristics.

use async_trait::async_trait;
use gattkit_protocol::{Capability, PolicySet, SessionError, SessionResult};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub allowed: Vec<Capability>,
    pub denied: Vec<Capability>,
}

impl PolicyEvaluation {
    pub fn is_allowed_now(&self) -> bool {
        self.denied.is_empty()
    }
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate_capabilities(&self, requested: &[Capability]) -> PolicyEvaluation;

    /// Whether any granted pattern starts with `prefix`, e.g. `"ble:write:"`.
    fn grants_any(&self, prefix: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct StaticPolicyEngine {
    allow: Vec<Capability>,
}

impl StaticPolicyEngine {
    pub fn from_policy_set(policy: &PolicySet) -> Self {
        Self {
            allow: policy.allow_capabilities.clone(),
        }
    }

    fn set_contains(&self, requested: &Capability) -> bool {
        self.allow.iter().any(|pattern| pattern.matches(requested))
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicyEngine {
    async fn evaluate_capabilities(&self, requested: &[Capability]) -> PolicyEvaluation {
        let mut allowed = IndexSet::new();
        let mut denied = IndexSet::new();

        for capability in requested {
            if self.set_contains(capability) {
                allowed.insert(capability.clone());
            } else {
                denied.insert(capability.clone());
            }
        }

        PolicyEvaluation {
            allowed: allowed.into_iter().collect(),
            denied: denied.into_iter().collect(),
        }
    }

    fn grants_any(&self, prefix: &str) -> bool {
        self.allow.iter().any(|pattern| pattern.as_str().starts_with(prefix))
    }
}

/// Fail with `PolicyDenied` unless every capability in `requested` is granted.
pub async fn authorize(engine: &dyn PolicyEngine, requested: &[Capability]) -> SessionResult<()> {
    let evaluation = engine.evaluate_capabilities(requested).await;
    let Some(first) = evaluation.denied.first() else {
        return Ok(());
    };
    debug!(capability = %first.as_str(), "capability denied");
    let message = match first.as_str().split(':').nth(1) {
        Some(op @ ("write" | "write_descriptor")) if !engine.grants_any(&format!("ble:{op}:")) => {
            "writes are disabled; restart with writes allowed to enable them".to_owned()
        }
        Some("write") => format!("{} is not in the write allowlist", first.as_str()),
        _ => format!("{} is not allowed by policy", first.as_str()),
    };
    Err(SessionError::PolicyDenied(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkit_protocol::ErrorCode;
    use uuid::Uuid;

    fn level() -> Uuid {
        Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb)
    }

    #[tokio::test]
    async fn default_policy_allows_reads_and_denies_writes() {
        let engine = StaticPolicyEngine::from_policy_set(&PolicySet::default());

        let evaluation = engine
            .evaluate_capabilities(&[Capability::read(&level()), Capability::subscribe(&level())])
            .await;
        assert!(evaluation.is_allowed_now());
        assert_eq!(evaluation.allowed.len(), 2);

        let evaluation = engine.evaluate_capabilities(&[Capability::write(&level())]).await;
        assert_eq!(evaluation.denied.len(), 1);
        assert!(evaluation.allowed.is_empty());
    }

    #[tokio::test]
    async fn allowlist_narrows_characteristic_writes_only() {
        let allowed = level();
        let other = Uuid::from_u128(0x2a19);
        let policy = PolicySet::from_write_settings(true, Some(&[allowed]));
        let engine = StaticPolicyEngine::from_policy_set(&policy);

        authorize(&engine, &[Capability::write(&allowed)]).await.unwrap();
        let err = authorize(&engine, &[Capability::write(&other)]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyDenied);
        assert!(err.to_string().contains("allowlist"));

        authorize(&engine, &[Capability::write_descriptor(&other)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_writes_say_so() {
        let engine = StaticPolicyEngine::from_policy_set(&PolicySet::from_write_settings(false, None));
        assert!(!engine.grants_any("ble:write:"));

        let err = authorize(&engine, &[Capability::write(&level())]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyDenied);
        assert!(err.to_string().contains("writes are disabled"));
    }

    #[tokio::test]
    async fn duplicate_requests_are_reported_once() {
        let engine = StaticPolicyEngine::from_policy_set(&PolicySet::default());
        let write = Capability::write(&level());
        let evaluation = engine.evaluate_capabilities(&[write.clone(), write]).await;
        assert_eq!(evaluation.denied.len(), 1);
    }
}
