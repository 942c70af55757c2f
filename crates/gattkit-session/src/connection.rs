//! Logical links to one device.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gattkit_protocol::{
    Catalog, ConnectionId, LinkHandle, SessionError, SessionResult, SpecRef, SubscriptionId,
};
use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use crate::subscription::{Subscription, SubscriptionSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    Requested,
    LinkLost,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Alive,
    Dead {
        at: DateTime<Utc>,
        cause: DisconnectCause,
    },
}

/// One connection and the subscriptions it owns.
///
/// `Alive -> Dead` is terminal. A dead session still answers status queries
/// but refuses data operations with `ConnectionNotAlive`.
#[derive(Debug)]
pub struct ConnectionSession {
    pub id: ConnectionId,
    pub address: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    link: LinkHandle,
    state: LinkState,
    catalog: Option<Arc<Catalog>>,
    spec: Option<SpecRef>,
    subscriptions: IndexMap<SubscriptionId, Subscription>,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, link: LinkHandle, name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            address: link.address.clone(),
            name,
            created_at: now,
            last_seen: now,
            link,
            state: LinkState::Alive,
            catalog: None,
            spec: None,
            subscriptions: IndexMap::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == LinkState::Alive
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn not_alive_error(&self) -> SessionError {
        SessionError::ConnectionNotAlive {
            connection_id: self.id.to_string(),
            address: self.address.clone(),
        }
    }

    /// The link for a data operation, or `ConnectionNotAlive`.
    pub fn alive_link(&mut self) -> SessionResult<LinkHandle> {
        if !self.is_alive() {
            return Err(self.not_alive_error());
        }
        self.last_seen = Utc::now();
        Ok(self.link.clone())
    }

    /// Flip to dead and tear down every owned subscription.
    ///
    /// Returns the characteristics that had live subscriptions, or `None` if
    /// the session was already dead.
    pub fn mark_dead(&mut self, cause: DisconnectCause, at: DateTime<Utc>) -> Option<Vec<Uuid>> {
        if !self.is_alive() {
            return None;
        }
        self.state = LinkState::Dead { at, cause };
        let mut characteristics = Vec::new();
        for subscription in self.subscriptions.values_mut() {
            if subscription.is_active() && !characteristics.contains(&subscription.characteristic) {
                characteristics.push(subscription.characteristic);
            }
            subscription.teardown();
        }
        Some(characteristics)
    }

    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.catalog.clone()
    }

    /// Cache a discovered catalog. The first cached catalog wins for the life of the session.
    pub fn cache_catalog(&mut self, catalog: Catalog) -> Arc<Catalog> {
        self.catalog
            .get_or_insert_with(|| Arc::new(catalog))
            .clone()
    }

    pub fn attach_spec(&mut self, spec: SpecRef) {
        self.spec = Some(spec);
    }

    pub fn spec(&self) -> Option<&SpecRef> {
        self.spec.as_ref()
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.insert(subscription.id.clone(), subscription);
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    pub fn remove_subscription(&mut self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions.shift_remove(id)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.values().filter(|s| s.is_active()).count()
    }

    /// Whether any other live subscription still listens on `characteristic`.
    pub fn is_subscribed(&self, characteristic: &Uuid) -> bool {
        self.subscriptions
            .values()
            .any(|s| s.is_active() && &s.characteristic == characteristic)
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn subscription_summaries(&self) -> Vec<SubscriptionSummary> {
        self.subscriptions.values().map(Subscription::summary).collect()
    }

    pub fn status(&self) -> ConnectionStatus {
        let (disconnect_ts, disconnect_cause) = match &self.state {
            LinkState::Alive => (None, None),
            LinkState::Dead { at, cause } => (Some(*at), Some(*cause)),
        };
        ConnectionStatus {
            connection_id: self.id.clone(),
            connected: self.is_alive(),
            address: self.address.clone(),
            disconnect_ts,
            disconnect_cause,
        }
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            connection_id: self.id.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
            connected: self.is_alive(),
            created_ts: self.created_at,
            last_seen_ts: self.last_seen,
            subscriptions: self.active_subscriptions(),
            spec: self.spec.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connection_id: ConnectionId,
    pub connected: bool,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_cause: Option<DisconnectCause>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub address: String,
    pub name: Option<String>,
    pub connected: bool,
    pub created_ts: DateTime<Utc>,
    pub last_seen_ts: DateTime<Utc>,
    pub subscriptions: usize,
    pub spec: Option<SpecRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::NotificationBuffer;
    use gattkit_protocol::{ErrorCode, Notification, SpecId};

    fn session() -> ConnectionSession {
        ConnectionSession::new(
            ConnectionId::from("c1"),
            LinkHandle {
                id: 1,
                address: "AA:BB".into(),
            },
            Some("Tag".into()),
        )
    }

    #[tokio::test]
    async fn mark_dead_is_terminal_and_freezes_subscriptions() {
        let mut connection = session();
        let buffer = Arc::new(NotificationBuffer::new(4));
        let characteristic = Uuid::from_u128(0x2a19);
        connection.add_subscription(Subscription::new(
            SubscriptionId::from("s1"),
            connection.id.clone(),
            characteristic,
            buffer.clone(),
            tokio::spawn(async {}),
        ));
        buffer.push(Notification::now(vec![1]));

        let torn_down = connection.mark_dead(DisconnectCause::LinkLost, Utc::now());
        assert_eq!(torn_down, Some(vec![characteristic]));
        assert!(connection.mark_dead(DisconnectCause::Requested, Utc::now()).is_none());
        assert!(buffer.is_closed());
        assert!(buffer.is_empty());

        let err = connection.alive_link().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionNotAlive);
        let status = connection.status();
        assert!(!status.connected);
        assert_eq!(status.disconnect_cause, Some(DisconnectCause::LinkLost));
        assert_eq!(status.address, "AA:BB");
    }

    #[test]
    fn first_catalog_wins() {
        let mut connection = session();
        let first = connection.cache_catalog(Catalog::default());
        let second = connection.cache_catalog(Catalog {
            services: vec![gattkit_protocol::ServiceInfo {
                uuid: Uuid::from_u128(1),
                characteristics: vec![],
            }],
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.services.is_empty());
    }

    #[test]
    fn spec_reference_is_opaque() {
        let mut connection = session();
        assert!(connection.spec().is_none());
        connection.attach_spec(SpecRef {
            spec_id: SpecId::from("sp1"),
            name: "Thermo protocol".into(),
        });
        assert_eq!(connection.summary().spec.map(|s| s.name), Some("Thermo protocol".into()));
    }
}
