//! BLE UUID parsing.
//!
//! Controllers may name a capability by its 16-bit short form (`"180a"`),
//! its 32-bit short form (`"0000180a"`) or the full 128-bit form. Short forms
//! expand against the Bluetooth base UUID.

use uuid::Uuid;

use crate::error::{SessionError, SessionResult};

pub const BLUETOOTH_BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16- or 32-bit assigned number against the Bluetooth base UUID.
pub const fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Parse a user-supplied UUID in any of the accepted forms.
pub fn parse_ble_uuid(raw: &str) -> SessionResult<Uuid> {
    let raw = raw.trim().to_ascii_lowercase();
    let expanded = match raw.len() {
        4 if is_hex(&raw) => format!("0000{raw}{BLUETOOTH_BASE_SUFFIX}"),
        8 if is_hex(&raw) => format!("{raw}{BLUETOOTH_BASE_SUFFIX}"),
        _ => raw,
    };
    Uuid::parse_str(&expanded)
        .map_err(|_| SessionError::InvalidArgument(format!("not a valid BLE UUID: {expanded}")))
}

fn is_hex(raw: &str) -> bool {
    raw.chars().all(|c| c.is_ascii_hexdigit())
}
