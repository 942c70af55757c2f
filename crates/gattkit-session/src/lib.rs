//! # gattkit-session — the session state engine
//!
//! Owns every long-lived device activity a controller can drive: background
//! scans, connections and notification subscriptions. Short request/response
//! calls observe and steer these activities through [`SessionRegistry`]
//! while the device driver pushes discoveries, notifications and link
//! losses into the same objects in the background.
//!
//! ## Module Overview
//!
//! - [`buffer`] — Bounded notification buffer with poll/wait/drain consumption
//! - [`scan`] — Scan sessions and their terminal stop transition
//! - [`connection`] — Connection sessions, liveness and cached catalogs
//! - [`subscription`] — Subscriptions binding a buffer to a characteristic
//! - [`registry`] — The session table and every operation on it
//! - [`retry`] — Retry of transient driver failures
//! - [`config`] — Limits, capacities and timing defaults

pub mod buffer;
pub mod config;
pub mod connection;
pub mod registry;
pub mod retry;
pub mod scan;
pub mod subscription;

pub use buffer::{Batch, NotificationBuffer, PushOutcome};
pub use config::{RegistryConfig, RetryPolicy};
pub use connection::{ConnectionSession, ConnectionStatus, ConnectionSummary, DisconnectCause};
pub use registry::{
    ConnectOutcome, ConnectRequest, MtuInfo, ScanRequest, SessionAlert, SessionRegistry,
    SubscriptionOutcome, Waited,
};
pub use scan::{ScanSession, ScanSnapshot, ScanSummary, StopReason};
pub use subscription::{Subscription, SubscriptionSummary};
