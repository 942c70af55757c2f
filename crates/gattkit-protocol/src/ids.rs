//! Canonical ID types for gattkit sessions.
//!
//! IDs are opaque String wrappers (serde-transparent). Generated ids are the
//! first 12 hex characters of a random UUID v4, short enough for a controller
//! to echo back verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of generated ids.
pub const SHORT_ID_LEN: usize = 12;

fn short_id() -> String {
    let mut raw = uuid::Uuid::new_v4().simple().to_string();
    raw.truncate(SHORT_ID_LEN);
    raw
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(short_id())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of a background scan.
    ScanId
);
typed_id!(
    /// Identifier of a logical link to one device.
    ConnectionId
);
typed_id!(
    /// Identifier of a notification subscription.
    SubscriptionId
);
typed_id!(
    /// Identifier of a registered protocol spec.
    SpecId
);
typed_id!(
    /// Identifier of one serviced call, used to pair trace markers.
    CallId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_short_hex_and_unique() {
        let a = ScanId::generate();
        let b = ScanId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), SHORT_ID_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn connection_id_from_string() {
        let id = ConnectionId::from_string("conn-1");
        assert_eq!(id.as_str(), "conn-1");
        assert_eq!(id.to_string(), "conn-1");
    }

    #[test]
    fn typed_id_is_serde_transparent() {
        let id = SubscriptionId::from("abc123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc123\"");
        let back: SubscriptionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
