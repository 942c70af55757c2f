//! The uniform success/failure envelope returned across the outer boundary.
//!
//! Success flattens the named result fields next to `ok: true`; failure
//! carries `ok: false` and an `error: {code, message}` object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, SessionError, SessionResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(flatten)]
    pub result: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    /// Wrap a payload. Objects are flattened; anything else lands under `result`.
    pub fn ok(payload: impl Serialize) -> Self {
        match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => Self {
                ok: true,
                result: map,
                error: None,
            },
            Ok(other) => {
                let mut map = Map::new();
                map.insert("result".to_owned(), other);
                Self {
                    ok: true,
                    result: map,
                    error: None,
                }
            }
            Err(err) => Self::err(&SessionError::Internal(format!(
                "failed to encode result: {err}"
            ))),
        }
    }

    pub fn err(error: &SessionError) -> Self {
        Self {
            ok: false,
            result: Map::new(),
            error: Some(ErrorBody {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }

    pub fn from_result<T: Serialize>(result: SessionResult<T>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(error) => Self::err(&error),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|body| body.code)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.result.get(field)
    }
}
