//! RPC message envelope shared by every transport.
//!
//! ```text
//! Request:  { "id": <string|int>, "method": <string>, "params": <object> }
//! Response: { "id": <string|int>, "result": <any> }
//!         | { "id": <string|int>, "error": { "code": <int>, "message": <string> } }
//! ```

use crate::error::{ProtocolError, RpcError, METHOD_NOT_FOUND_CODE};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_HEALTH: &str = "health";

/// Correlation id. Peers may answer with either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{}", n),
            RpcId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        RpcId::Number(n)
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        RpcId::Text(s.to_string())
    }
}

impl From<String> for RpcId {
    fn from(s: String) -> Self {
        RpcId::Text(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RpcId,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: JsonValue,
}

impl RpcRequest {
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>, params: JsonValue) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

fn empty_params() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

/// Error object carried in a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Outcome half of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(JsonValue),
    Error(RpcErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: RpcId,
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn success(id: impl Into<RpcId>, result: JsonValue) -> Self {
        Self {
            id: id.into(),
            outcome: RpcOutcome::Result(result),
        }
    }

    pub fn failure(id: impl Into<RpcId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: RpcOutcome::Error(RpcErrorObject {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: impl Into<RpcId>, method: &str) -> Self {
        Self::failure(id, METHOD_NOT_FOUND_CODE, format!("method not found: {}", method))
    }

    /// Parse a response from raw JSON, rejecting anything that is not exactly
    /// one of the two envelope shapes.
    pub fn parse(service: &str, raw: &str) -> Result<Self, ProtocolError> {
        let value: JsonValue = serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed {
            service: service.to_string(),
            reason: format!("invalid JSON: {}", e),
        })?;
        Self::from_value(service, value)
    }

    pub fn from_value(service: &str, value: JsonValue) -> Result<Self, ProtocolError> {
        let malformed = |reason: &str| ProtocolError::Malformed {
            service: service.to_string(),
            reason: reason.to_string(),
        };

        let mut object = match value {
            JsonValue::Object(map) => map,
            _ => return Err(malformed("response is not an object")),
        };

        let id: RpcId = object
            .remove("id")
            .ok_or_else(|| malformed("missing id"))
            .and_then(|v| serde_json::from_value(v).map_err(|_| malformed("id must be a string or integer")))?;

        match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => Ok(Self::success(id, result)),
            (None, Some(error)) => {
                let error: RpcErrorObject = serde_json::from_value(error)
                    .map_err(|_| malformed("error must carry an integer code and a message"))?;
                Ok(Self {
                    id,
                    outcome: RpcOutcome::Error(error),
                })
            }
            (Some(_), Some(_)) => Err(malformed("response carries both result and error")),
            (None, None) => Err(malformed("response carries neither result nor error")),
        }
    }

    pub fn to_value(&self) -> JsonValue {
        let mut object = serde_json::Map::new();
        object.insert(
            "id".to_string(),
            serde_json::to_value(&self.id).unwrap_or(JsonValue::Null),
        );
        match &self.outcome {
            RpcOutcome::Result(result) => {
                object.insert("result".to_string(), result.clone());
            }
            RpcOutcome::Error(error) => {
                object.insert(
                    "error".to_string(),
                    serde_json::json!({ "code": error.code, "message": error.message }),
                );
            }
        }
        JsonValue::Object(object)
    }

    /// Turn the envelope into the caller-facing result.
    pub fn into_result(self, service: &str, method: &str) -> Result<JsonValue, RpcError> {
        match self.outcome {
            RpcOutcome::Result(value) => Ok(value),
            RpcOutcome::Error(error) if error.code == METHOD_NOT_FOUND_CODE => {
                Err(ProtocolError::NotImplemented {
                    service: service.to_string(),
                    method: method.to_string(),
                }
                .into())
            }
            RpcOutcome::Error(error) => Err(ProtocolError::Remote {
                service: service.to_string(),
                code: error.code,
                message: error.message,
            }
            .into()),
        }
    }
}
