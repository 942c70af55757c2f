//! Boundaries between the session engine and its collaborators.
//!
//! The engine talks to device I/O only through [`DeviceDriver`] and resolves
//! protocol-spec ids only through [`SpecStore`].
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Streams are boxed (`DiscoveryStream`, `NotificationStream`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::device::{DeviceRecord, ScanFilter};
use crate::error::SessionResult;
use crate::gatt::{Catalog, DescriptorRef, Notification};
use crate::ids::{ScanId, SpecId};

/// Failures reported by a device driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("operation timed out")]
    Timeout,
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("link is disconnected")]
    Disconnected,
    /// Worth retrying (busy adapter, dropped ATT request).
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("no such characteristic or descriptor: {0}")]
    UnknownCapability(String),
    #[error("unsupported by this driver: {0}")]
    Unsupported(String),
    #[error("driver fault: {0}")]
    Fault(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Opaque handle to one live link, minted by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    pub id: u64,
    pub address: String,
}

pub type DiscoveryStream = BoxStream<'static, DeviceRecord>;
pub type NotificationStream = BoxStream<'static, Notification>;

/// Invoked by the driver, at most once per link, when the link drops unasked.
pub type DisconnectCallback = Arc<dyn Fn(DateTime<Utc>) + Send + Sync>;

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Start discovery. The stream ends when the driver stops the scan.
    async fn start_scan(&self, scan_id: &ScanId, filter: &ScanFilter)
    -> DriverResult<DiscoveryStream>;

    async fn stop_scan(&self, scan_id: &ScanId) -> DriverResult<()>;

    /// Open a link. Dropping the returned future must abandon the attempt.
    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectCallback,
    ) -> DriverResult<LinkHandle>;

    async fn disconnect(&self, link: &LinkHandle) -> DriverResult<()>;

    fn is_connected(&self, link: &LinkHandle) -> bool;

    async fn discover(&self, link: &LinkHandle) -> DriverResult<Catalog>;

    async fn mtu(&self, link: &LinkHandle) -> DriverResult<u16>;

    async fn read(&self, link: &LinkHandle, characteristic: Uuid) -> DriverResult<Vec<u8>>;

    async fn write(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> DriverResult<()>;

    async fn read_descriptor(
        &self,
        link: &LinkHandle,
        descriptor: DescriptorRef,
    ) -> DriverResult<Vec<u8>>;

    async fn write_descriptor(
        &self,
        link: &LinkHandle,
        descriptor: DescriptorRef,
        value: &[u8],
    ) -> DriverResult<()>;

    async fn subscribe(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
    ) -> DriverResult<NotificationStream>;

    async fn unsubscribe(&self, link: &LinkHandle, characteristic: Uuid) -> DriverResult<()>;
}

/// The only thing a connection remembers about an attached protocol spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecRef {
    pub spec_id: SpecId,
    pub name: String,
}

#[async_trait]
pub trait SpecStore: Send + Sync {
    async fn resolve(&self, spec_id: &SpecId) -> SessionResult<SpecRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(DriverError::Transient("busy".into()).is_transient());
        assert!(!DriverError::Timeout.is_transient());
        assert!(!DriverError::Disconnected.is_transient());
    }
}
