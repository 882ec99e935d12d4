//! Front-end side of the local IPC channel: finds or starts the backend,
//! keeps one multiplexed connection to it, and watches the child it spawned.

mod connection;
mod process;
mod supervisor;

use std::time::Duration;

use kiln_protocol::{ProtocolError, RpcError};

pub use connection::IpcConnection;
pub use process::{
    binary_candidates, locate_backend, BackendExit, BackendLauncher, BackendProcess,
    BackendTarget, ProcessLauncher,
};
pub use supervisor::{ConnectionSupervisor, SupervisorOptions};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("could not reach backend at {addr} after {attempts} attempts")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("backend executable not found")]
    BackendNotFound,
    #[error("failed to spawn backend")]
    Spawn(#[source] std::io::Error),
    #[error("backend exited cleanly during startup; another instance owns its resources")]
    FatalStartup { exit: BackendExit },
    #[error("connection to backend lost")]
    ConnectionLost,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("backend error {0}")]
    Remote(#[from] RpcError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("supervisor has been shut down")]
    ShutDown,
}
