//! # gattkit-tools — the tool surface
//!
//! Every controller call is a tool name plus a JSON argument object. This
//! crate declares the tool catalog, parses and clamps arguments, applies the
//! policy gate and folds every outcome into an [`Envelope`](gattkit_protocol::Envelope).
//!
//! - [`catalog`] — Tool definitions with JSON input schemas
//! - [`args`] — Argument extraction and clamping
//! - [`dispatcher`] — Routing calls to the session registry
//! - [`specs`] — Protocol spec reference index
//! - [`extensions`] — Extra operations registered at startup

pub mod args;
pub mod catalog;
pub mod dispatcher;
pub mod extensions;
pub mod specs;

pub use catalog::{ToolDefinition, ToolRegistry};
pub use dispatcher::{ToolDispatcher, notification_json};
pub use extensions::{
    ExtensionDescriptor, ExtensionHandler, ExtensionMatching, ExtensionOperation,
    ExtensionRegistry,
};
pub use specs::{SpecEntry, SpecIndex, SpecRegistration};
