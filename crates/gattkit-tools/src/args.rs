//! Reading tool arguments out of a JSON object.
//!
//! Numeric and boolean arguments also accept their string spellings, and
//! out-of-range numbers are clamped rather than rejected.

use std::time::Duration;

use gattkit_protocol::{
    ConnectionId, SessionError, SessionResult, SpecId, SubscriptionId, parse_ble_uuid,
};
use serde_json::Value;
use uuid::Uuid;

fn invalid(message: String) -> SessionError {
    SessionError::InvalidArgument(message)
}

fn present<'a>(args: &'a Value, key: &str) -> Option<&'a Value> {
    args.get(key).filter(|value| !value.is_null())
}

pub fn optional_str<'a>(args: &'a Value, key: &str) -> SessionResult<Option<&'a str>> {
    match present(args, key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(invalid(format!("{key} must be a string, got {other}"))),
    }
}

pub fn required_str<'a>(args: &'a Value, key: &str) -> SessionResult<&'a str> {
    optional_str(args, key)?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid(format!("{key} is required")))
}

pub fn connection_id(args: &Value) -> SessionResult<ConnectionId> {
    required_str(args, "connection_id").map(|s| ConnectionId::from(s.trim()))
}

pub fn subscription_id(args: &Value) -> SessionResult<SubscriptionId> {
    required_str(args, "subscription_id").map(|s| SubscriptionId::from(s.trim()))
}

pub fn spec_id(args: &Value) -> SessionResult<SpecId> {
    required_str(args, "spec_id").map(|s| SpecId::from(s.trim()))
}

pub fn uuid(args: &Value, key: &str) -> SessionResult<Uuid> {
    parse_ble_uuid(required_str(args, key)?)
}

pub fn optional_uuid(args: &Value, key: &str) -> SessionResult<Option<Uuid>> {
    optional_str(args, key)?.map(parse_ble_uuid).transpose()
}

pub fn uuid_list(args: &Value, key: &str) -> SessionResult<Vec<Uuid>> {
    match present(args, key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => parse_ble_uuid(s),
                other => Err(invalid(format!("{key} entries must be strings, got {other}"))),
            })
            .collect(),
        Some(other) => Err(invalid(format!("{key} must be an array, got {other}"))),
    }
}

fn number(args: &Value, key: &str) -> SessionResult<Option<f64>> {
    match present(args, key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(format!("{key} is not a finite number"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid(format!("{key} must be a number, got {s:?}"))),
        Some(other) => Err(invalid(format!("{key} must be a number, got {other}"))),
    }
}

/// A duration in seconds, clamped to `[lo, hi]`.
pub fn seconds(args: &Value, key: &str, default: f64, lo: f64, hi: f64) -> SessionResult<Duration> {
    let value = number(args, key)?.unwrap_or(default);
    if value.is_nan() {
        return Err(invalid(format!("{key} must be a number")));
    }
    Ok(Duration::from_secs_f64(value.clamp(lo, hi)))
}

/// A count, truncated toward zero and clamped to `[lo, hi]`.
pub fn count(args: &Value, key: &str, default: usize, lo: usize, hi: usize) -> SessionResult<usize> {
    let Some(value) = number(args, key)? else {
        return Ok(default.clamp(lo, hi));
    };
    if value.is_nan() {
        return Err(invalid(format!("{key} must be a number")));
    }
    Ok((value.trunc().max(0.0) as usize).clamp(lo, hi))
}

pub fn boolean(args: &Value, key: &str, default: bool) -> SessionResult<bool> {
    match present(args, key) {
        None => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(invalid(format!("{key} must be a boolean, got {s:?}"))),
        },
        Some(Value::Number(n)) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        Some(other) => Err(invalid(format!("{key} must be a boolean, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkit_protocol::ErrorCode;
    use serde_json::json;

    #[test]
    fn numbers_accept_strings_and_clamp() {
        let args = json!({"timeout_s": "120", "max_items": 0, "idle": 0.5});
        assert_eq!(
            seconds(&args, "timeout_s", 10.0, 0.1, 60.0).unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(count(&args, "max_items", 50, 1, 1000).unwrap(), 1);
        assert_eq!(count(&args, "missing", 50, 1, 1000).unwrap(), 50);
        assert_eq!(
            seconds(&args, "idle", 0.25, 0.01, 10.0).unwrap(),
            Duration::from_millis(500)
        );

        let err = seconds(&json!({"timeout_s": "soon"}), "timeout_s", 10.0, 0.1, 60.0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn booleans_accept_common_spellings() {
        let args = json!({"a": "TRUE", "b": "no", "c": false, "d": null});
        assert!(boolean(&args, "a", false).unwrap());
        assert!(!boolean(&args, "b", true).unwrap());
        assert!(!boolean(&args, "c", true).unwrap());
        assert!(boolean(&args, "d", true).unwrap());
        assert!(boolean(&json!({"a": "maybe"}), "a", true).is_err());
    }

    #[test]
    fn required_strings_reject_blank_and_wrong_types() {
        assert_eq!(
            required_str(&json!({"address": "  "}), "address").unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        assert!(required_str(&json!({"address": 5}), "address").is_err());
        assert_eq!(
            connection_id(&json!({"connection_id": " c1 "})).unwrap(),
            ConnectionId::from("c1")
        );
    }

    #[test]
    fn uuid_arguments_expand_short_forms() {
        let args = json!({"char_uuid": "2A19", "services": ["180f", "0000180a"]});
        assert_eq!(
            uuid(&args, "char_uuid").unwrap().to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(uuid_list(&args, "services").unwrap().len(), 2);
        assert!(optional_uuid(&args, "missing").unwrap().is_none());
        assert!(uuid(&json!({"char_uuid": "xyz"}), "char_uuid").is_err());
    }
}
