//! Client for the external generation service: HTTP API, websocket push
//! channel and process launcher.

mod client;
mod launch;
mod push;
mod workflow;

use std::time::Duration;

pub use client::{QueueSnapshot, ServiceClient};
pub use launch::{LaunchOutcome, ServiceLauncher};
pub use push::{classify_push, PushSignal, PushSubscription};
pub use workflow::{build_workflow, prompt_request};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid service url {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("service rejected {endpoint} with status {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("unexpected response from {endpoint}: {detail}")]
    Malformed { endpoint: String, detail: String },
    #[error("service is not running and no launch command is configured")]
    NotRunning,
    #[error("failed to launch service: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("service exited during startup ({status})")]
    ExitedDuringStartup { status: String },
    #[error("service did not become ready within {0:?}")]
    StartupTimeout(Duration),
}
