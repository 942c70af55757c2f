//! # gattkit-protocol — shared contract for the gattkit workspace
//!
//! Types, error taxonomy and trait ports shared by the session engine, the
//! device drivers and the outer dispatch layers. It carries no runtime
//! dependency (no tokio), so drivers and extension hosts can depend on it
//! without pulling in the engine.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed short ids (ScanId, ConnectionId, SubscriptionId, SpecId, CallId)
//! - [`ble_uuid`] — Short/long BLE UUID parsing
//! - [`bytes`] — Hex-serialized byte blobs and wire encoding of values
//! - [`device`] — Advertisement records and scan filters
//! - [`gatt`] — Service/characteristic catalog, descriptor refs, notifications
//! - [`error`] — SessionError, ErrorCode, SessionResult
//! - [`envelope`] — The uniform success/failure envelope
//! - [`policy`] — Capability tokens and policy sets
//! - [`trace`] — Structured call-trace events
//! - [`ports`] — Device driver and spec store boundaries

pub mod ble_uuid;
pub mod bytes;
pub mod device;
pub mod envelope;
pub mod error;
pub mod gatt;
pub mod ids;
pub mod policy;
pub mod ports;
pub mod trace;

pub use ble_uuid::{BLUETOOTH_BASE_SUFFIX, parse_ble_uuid, uuid_from_short};
pub use bytes::{HexBytes, decode_value, encode_value};
pub use device::{DeviceRecord, RSSI_UNKNOWN, ScanFilter};
pub use envelope::{Envelope, ErrorBody};
pub use error::{ErrorCode, SessionError, SessionKind, SessionResult};
pub use gatt::{Catalog, CharacteristicInfo, DescriptorInfo, DescriptorRef, Notification, ServiceInfo};
pub use ids::{CallId, ConnectionId, ScanId, SpecId, SubscriptionId};
pub use policy::{Capability, PolicySet};
pub use ports::{
    DeviceDriver, DisconnectCallback, DiscoveryStream, DriverError, DriverResult, LinkHandle,
    NotificationStream, SpecRef, SpecStore,
};
pub use trace::{TraceEvent, TraceEventKind};
