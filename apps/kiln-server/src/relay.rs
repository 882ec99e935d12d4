//! Wiring between the job bus and the remote bridge.
//!
//! Job topics are forwarded to the visual client as bridge events, the
//! client may query jobs back, and a watchdog re-dials the bridge after the
//! reconnect policy gives up.

use std::time::Duration;

use kiln_bridge::{Bridge, ConnectionState};
use kiln_topics::{
    BRIDGE_EVENT_COMPLETE, BRIDGE_EVENT_PROGRESS, TOPIC_JOB_COMPLETED, TOPIC_JOB_PROGRESS,
};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::handlers;
use crate::tasks::TaskHandle;

/// Bridge event kind for a bus topic, `None` for topics that stay local.
pub fn bridge_kind(topic: &str) -> Option<&str> {
    match topic {
        TOPIC_JOB_PROGRESS => Some(BRIDGE_EVENT_PROGRESS),
        TOPIC_JOB_COMPLETED => Some(BRIDGE_EVENT_COMPLETE),
        other if other.starts_with("job.") => Some(other),
        _ => None,
    }
}

pub(crate) fn start(state: &AppState) -> Vec<TaskHandle> {
    register_queries(state);
    let mut tasks = vec![TaskHandle::new("relay.bus_to_bridge", spawn_bus_relay(state))];
    if state.config.bridge.enabled {
        tasks.push(TaskHandle::new("relay.bridge_watchdog", spawn_watchdog(state)));
    } else {
        info!(target: "kiln::bridge", "bridge disabled by configuration");
    }
    tasks
}

fn spawn_bus_relay(state: &AppState) -> tokio::task::JoinHandle<()> {
    let mut rx = state.bus.subscribe();
    let bridge = state.bridge.clone();
    let token = state.shutdown.clone();
    tokio::spawn(async move {
        loop {
            let env = tokio::select! {
                _ = token.cancelled() => break,
                recv = rx.recv() => match recv {
                    Ok(env) => env,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "kiln::bridge", skipped, "relay fell behind the job bus");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            let Some(kind) = bridge_kind(&env.kind) else {
                continue;
            };
            if !bridge.emit(kind, env.payload) {
                debug!(target: "kiln::bridge", topic = %env.kind, "job event not relayed; bridge offline");
            }
        }
    })
}

/// Queries the visual client may send back to the backend.
fn register_queries(state: &AppState) {
    let st = state.clone();
    state.bridge.register_handler("job_status", move |params: Value| {
        let st = st.clone();
        async move {
            let id = params
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| "`id` is required".to_string())?;
            handlers::lookup_job(&st, id).map_err(|err| err.to_string())
        }
    });

    let st = state.clone();
    state.bridge.register_handler("list_jobs", move |_params: Value| {
        let st = st.clone();
        async move { Ok(handlers::list_jobs(&st)) }
    });

    let st = state.clone();
    state.bridge.register_handler("submit_job", move |params: Value| {
        let st = st.clone();
        async move {
            let job = st
                .orchestrator
                .submit(params)
                .map_err(|err| handlers::job_error(err).to_string())?;
            Ok(json!({ "id": job.id, "status": job.status }))
        }
    });
}

fn spawn_watchdog(state: &AppState) -> tokio::task::JoinHandle<()> {
    let bridge = state.bridge.clone();
    let token = state.shutdown.clone();
    let period = state.config.bridge.reconnect().cap.max(Duration::from_secs(1));
    tokio::spawn(async move {
        loop {
            if bridge.state() == ConnectionState::Disconnected {
                redial(&bridge).await;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
    })
}

async fn redial(bridge: &Bridge) {
    match bridge.connect().await {
        Ok(kind) => debug!(target: "kiln::bridge", transport = kind.as_str(), "watchdog connected bridge"),
        Err(err) => warn!(target: "kiln::bridge", error = %err, "bridge unavailable"),
    }
}
