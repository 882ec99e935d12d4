//! Message bridge to the remote visual client over one of two websocket
//! transports.

mod bridge;
mod state;
mod transport;

use std::time::Duration;

pub use bridge::{Bridge, BridgeOptions, QueryHandler};
pub use kiln_core::TransportPreference;
pub use state::ConnectionState;
pub use transport::{select_transport, ReconnectPolicy, SecurityContext, TransportKind};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{requested:?} transport cannot be used from a {context:?} context")]
    TransportUnavailable {
        requested: TransportKind,
        context: SecurityContext,
    },
    #[error("no usable endpoint for the {kind:?} transport: {reason}")]
    BadEndpoint { kind: TransportKind, reason: String },
    #[error("failed to connect to {url} after {attempts} attempts: {last_error}")]
    ConnectFailed {
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error("bridge is not connected")]
    NotConnected,
    #[error("transport dropped before a response arrived")]
    Disconnected,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Protocol(#[from] kiln_protocol::ProtocolError),
}
