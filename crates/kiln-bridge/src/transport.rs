use kiln_core::{Backoff, TransportPreference};

use crate::BridgeError;

/// Reconnect schedule: doubling delay, capped, bounded attempts.
pub type ReconnectPolicy = Backoff;

/// Whether the bridge runs where plain sockets are disallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityContext {
    Secure,
    Insecure,
}

impl SecurityContext {
    pub fn from_flag(secure: bool) -> Self {
        if secure {
            SecurityContext::Secure
        } else {
            SecurityContext::Insecure
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Plain `ws://` socket to a loopback endpoint.
    LocalSocket,
    /// TLS `wss://` channel to the peer endpoint.
    Peer,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LocalSocket => "local",
            TransportKind::Peer => "peer",
        }
    }

    pub(crate) fn scheme(&self) -> &'static str {
        match self {
            TransportKind::LocalSocket => "ws://",
            TransportKind::Peer => "wss://",
        }
    }
}

/// Pick the transport for one connection attempt.
///
/// `Auto` follows the security context. An explicit `Local` from a secure
/// context is refused because the plain transport is unusable there.
pub fn select_transport(
    preference: TransportPreference,
    context: SecurityContext,
) -> Result<TransportKind, BridgeError> {
    match (preference, context) {
        (TransportPreference::Auto, SecurityContext::Secure) => Ok(TransportKind::Peer),
        (TransportPreference::Auto, SecurityContext::Insecure) => Ok(TransportKind::LocalSocket),
        (TransportPreference::Local, SecurityContext::Secure) => {
            Err(BridgeError::TransportUnavailable {
                requested: TransportKind::LocalSocket,
                context,
            })
        }
        (TransportPreference::Local, SecurityContext::Insecure) => Ok(TransportKind::LocalSocket),
        (TransportPreference::Peer, _) => Ok(TransportKind::Peer),
    }
}

pub(crate) fn endpoint_for(
    kind: TransportKind,
    local_url: &str,
    peer_url: Option<&str>,
) -> Result<String, BridgeError> {
    let url = match kind {
        TransportKind::LocalSocket => Some(local_url),
        TransportKind::Peer => peer_url,
    }
    .map(str::trim)
    .filter(|u| !u.is_empty())
    .ok_or_else(|| BridgeError::BadEndpoint {
        kind,
        reason: "not configured".into(),
    })?;
    if !url.to_ascii_lowercase().starts_with(kind.scheme()) {
        return Err(BridgeError::BadEndpoint {
            kind,
            reason: format!("{url} does not use {}", kind.scheme()),
        });
    }
    Ok(url.to_string())
}
