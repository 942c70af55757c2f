//! Structured call-trace events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::ids::{CallId, ConnectionId};

/// One entry in the trace journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEventKind {
    CallStarted {
        call_id: CallId,
        tool: String,
    },
    CallFinished {
        call_id: CallId,
        tool: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        duration_ms: u64,
    },
    LinkLost {
        connection_id: ConnectionId,
        address: String,
    },
}

impl TraceEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallStarted { .. } => "call_started",
            Self::CallFinished { .. } => "call_finished",
            Self::LinkLost { .. } => "link_lost",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_and_flattened() {
        let event = TraceEvent {
            seq: 7,
            ts: Utc::now(),
            kind: TraceEventKind::CallFinished {
                call_id: CallId::from("c1"),
                tool: "ble.read".into(),
                ok: false,
                error_code: Some(ErrorCode::Timeout),
                duration_ms: 12,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["event"], "call_finished");
        assert_eq!(json["error_code"], "timeout");

        let back: TraceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind.name(), "call_finished");
    }
}
