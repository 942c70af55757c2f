use std::sync::Arc;

use chrono::{DateTime, Utc};
use gattkit_protocol::{ConnectionId, SubscriptionId};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::buffer::NotificationBuffer;

/// A notification buffer bound to one characteristic of one connection.
///
/// The pump task copies driver notifications into the buffer; tearing the
/// subscription down closes the buffer and aborts the pump.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub connection_id: ConnectionId,
    pub characteristic: Uuid,
    pub created_at: DateTime<Utc>,
    buffer: Arc<NotificationBuffer>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        connection_id: ConnectionId,
        characteristic: Uuid,
        buffer: Arc<NotificationBuffer>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            connection_id,
            characteristic,
            created_at: Utc::now(),
            buffer,
            pump: Some(pump),
        }
    }

    pub fn buffer(&self) -> Arc<NotificationBuffer> {
        self.buffer.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.buffer.is_closed()
    }

    pub fn teardown(&mut self) {
        self.buffer.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    pub fn summary(&self) -> SubscriptionSummary {
        SubscriptionSummary {
            subscription_id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            characteristic_uuid: self.characteristic,
            active: self.is_active(),
            queued: self.buffer.len(),
            dropped: self.buffer.dropped(),
            created_ts: self.created_at,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub subscription_id: SubscriptionId,
    pub connection_id: ConnectionId,
    pub characteristic_uuid: Uuid,
    pub active: bool,
    pub queued: usize,
    pub dropped: u64,
    pub created_ts: DateTime<Utc>,
}
