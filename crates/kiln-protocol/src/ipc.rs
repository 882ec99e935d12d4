use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One request frame on the IPC channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl IpcRequest {
    /// Build a request with a freshly generated correlation id.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    /// Params as an object, treating a missing or `null` value as `{}`.
    pub fn params_or_empty(&self) -> Value {
        match &self.params {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(v) => v.clone(),
        }
    }
}

/// Structured error payload carried in a response frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    pub const INVALID_PARAMS: &'static str = "invalid_params";
    pub const UNKNOWN_METHOD: &'static str = "unknown_method";
    pub const INTERNAL: &'static str = "internal";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(Self::UNKNOWN_METHOD, format!("unknown method `{method}`"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// One response frame on the IPC channel. Exactly one of `result`/`error`
/// is populated by well-behaved peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl IpcResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into a `Result`, mapping an empty success to `null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
