//! Wire types shared by the front-end, the backend and the remote bridge.
//!
//! Two framings live here: the newline-delimited JSON request/response
//! channel spoken over the local IPC socket, and the typed envelope carried
//! by either remote-bridge transport.

pub mod bridge;
pub mod codec;
pub mod ipc;

pub use bridge::{BridgeEnvelope, BridgeMessage, EnvelopeType};
pub use codec::{encode_line, LineBuffer, DEFAULT_MAX_LINE_BYTES};
pub use ipc::{IpcRequest, IpcResponse, RpcError};

/// Errors raised while decoding frames at a transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },
    #[error("frame is not valid utf-8")]
    NotUtf8,
    #[error("`{kind}` envelope missing required field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Current time in epoch milliseconds, used for envelope timestamps.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
