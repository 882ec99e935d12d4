use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{now_millis, ProtocolError};

/// Envelope kinds understood on the remote bridge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Query,
    Response,
    Ping,
    Pong,
    Progress,
    Complete,
    Event,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Query => "query",
            EnvelopeType::Response => "response",
            EnvelopeType::Ping => "ping",
            EnvelopeType::Pong => "pong",
            EnvelopeType::Progress => "progress",
            EnvelopeType::Complete => "complete",
            EnvelopeType::Event => "event",
        }
    }
}

/// Raw wire envelope, identical on both transports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl BridgeEnvelope {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Validated bridge message. Each variant carries only the fields its
/// envelope type requires, so dispatch never re-checks shape.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    Query {
        id: String,
        method: String,
        params: Value,
    },
    Response {
        id: String,
        ok: bool,
        result: Value,
        error: Option<String>,
    },
    Ping {
        id: String,
    },
    Pong {
        id: String,
    },
    Progress {
        data: Value,
    },
    Complete {
        data: Value,
    },
    Event {
        kind: String,
        data: Value,
    },
}

impl BridgeMessage {
    pub fn query(method: impl Into<String>, params: Value) -> Self {
        BridgeMessage::Query {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        BridgeMessage::Response {
            id: id.into(),
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        BridgeMessage::Response {
            id: id.into(),
            ok: false,
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn ping() -> Self {
        BridgeMessage::Ping {
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn kind(&self) -> EnvelopeType {
        match self {
            BridgeMessage::Query { .. } => EnvelopeType::Query,
            BridgeMessage::Response { .. } => EnvelopeType::Response,
            BridgeMessage::Ping { .. } => EnvelopeType::Ping,
            BridgeMessage::Pong { .. } => EnvelopeType::Pong,
            BridgeMessage::Progress { .. } => EnvelopeType::Progress,
            BridgeMessage::Complete { .. } => EnvelopeType::Complete,
            BridgeMessage::Event { .. } => EnvelopeType::Event,
        }
    }

    /// Wire form stamped with the current time.
    pub fn into_envelope(self) -> BridgeEnvelope {
        let kind = self.kind();
        let (id, data) = match self {
            BridgeMessage::Query { id, method, params } => {
                (Some(id), Some(json!({ "method": method, "params": params })))
            }
            BridgeMessage::Response {
                id,
                ok,
                result,
                error,
            } => {
                let mut data = json!({ "ok": ok, "result": result });
                if let (Some(err), Value::Object(map)) = (error, &mut data) {
                    map.insert("error".into(), Value::String(err));
                }
                (Some(id), Some(data))
            }
            BridgeMessage::Ping { id } | BridgeMessage::Pong { id } => (Some(id), None),
            BridgeMessage::Progress { data } | BridgeMessage::Complete { data } => {
                (None, Some(data))
            }
            BridgeMessage::Event { kind, data } => {
                (None, Some(json!({ "kind": kind, "payload": data })))
            }
        };
        BridgeEnvelope {
            kind,
            id,
            data,
            timestamp: Some(now_millis()),
        }
    }

    pub fn to_text(self) -> Result<String, ProtocolError> {
        self.into_envelope().to_text()
    }
}

impl TryFrom<BridgeEnvelope> for BridgeMessage {
    type Error = ProtocolError;

    fn try_from(env: BridgeEnvelope) -> Result<Self, Self::Error> {
        let kind = env.kind.as_str();
        let need_id = |id: Option<String>| {
            id.filter(|s| !s.is_empty())
                .ok_or(ProtocolError::MissingField { kind, field: "id" })
        };
        let need_data = |data: Option<Value>| {
            data.filter(|v| !v.is_null())
                .ok_or(ProtocolError::MissingField {
                    kind,
                    field: "data",
                })
        };
        match env.kind {
            EnvelopeType::Query => {
                let id = need_id(env.id)?;
                let data = need_data(env.data)?;
                let method = data
                    .get("method")
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .ok_or(ProtocolError::MissingField {
                        kind,
                        field: "method",
                    })?
                    .to_string();
                let params = data.get("params").cloned().unwrap_or(Value::Null);
                Ok(BridgeMessage::Query { id, method, params })
            }
            EnvelopeType::Response => {
                let id = need_id(env.id)?;
                let data = need_data(env.data)?;
                let ok = data
                    .get("ok")
                    .and_then(Value::as_bool)
                    .ok_or(ProtocolError::MissingField { kind, field: "ok" })?;
                let result = data.get("result").cloned().unwrap_or(Value::Null);
                let error = data
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(BridgeMessage::Response {
                    id,
                    ok,
                    result,
                    error,
                })
            }
            EnvelopeType::Ping => Ok(BridgeMessage::Ping {
                id: need_id(env.id)?,
            }),
            EnvelopeType::Pong => Ok(BridgeMessage::Pong {
                id: need_id(env.id)?,
            }),
            EnvelopeType::Progress => Ok(BridgeMessage::Progress {
                data: need_data(env.data)?,
            }),
            EnvelopeType::Complete => Ok(BridgeMessage::Complete {
                data: need_data(env.data)?,
            }),
            EnvelopeType::Event => {
                let data = need_data(env.data)?;
                let event_kind = data
                    .get("kind")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField {
                        kind,
                        field: "kind",
                    })?
                    .to_string();
                let payload = data.get("payload").cloned().unwrap_or(Value::Null);
                Ok(BridgeMessage::Event {
                    kind: event_kind,
                    data: payload,
                })
            }
        }
    }
}
