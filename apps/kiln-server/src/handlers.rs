use kiln_bridge::BridgeError;
use kiln_core::orchestrator::{JobError, JobLookup};
use kiln_protocol::{IpcRequest, IpcResponse, RpcError};
use serde_json::{json, Value};
use tracing::debug;

use crate::app_state::AppState;

pub const CODE_NOT_FOUND: &str = "not_found";
pub const CODE_EXPIRED: &str = "expired";
pub const CODE_JOB_TERMINAL: &str = "job_terminal";
pub const CODE_CAPACITY: &str = "capacity";
pub const CODE_BRIDGE_UNAVAILABLE: &str = "bridge_unavailable";

/// Methods served over IPC, with a one-line description each.
pub const TOOLS: &[(&str, &str)] = &[
    ("ping", "liveness check"),
    ("list_tools", "list the methods this backend serves"),
    ("submit_job", "queue an image generation job: {prompt, size?, steps?, seed?, negative_prompt?}"),
    ("job_status", "snapshot of one job: {id}"),
    ("cancel_job", "cancel a live job: {id}"),
    ("list_jobs", "all tracked jobs, newest first"),
    ("list_scenes", "scenes known to the remote visual client"),
    ("service_status", "generation service and bridge health"),
    ("shutdown", "stop this backend"),
];

type Reply = Result<Value, RpcError>;

pub async fn dispatch(state: &AppState, req: IpcRequest) -> IpcResponse {
    let params = req.params_or_empty();
    debug!(target: "kiln::server", id = %req.id, method = %req.method, "ipc request");
    let reply = match req.method.as_str() {
        "ping" => Ok(ping()),
        "list_tools" => Ok(list_tools()),
        "submit_job" => submit_job(state, params),
        "job_status" => job_status(state, &params),
        "cancel_job" => cancel_job(state, &params),
        "list_jobs" => Ok(list_jobs(state)),
        "list_scenes" => list_scenes(state).await,
        "service_status" => Ok(service_status(state).await),
        "shutdown" => {
            state.request_shutdown();
            Ok(json!({"ok": true}))
        }
        other => Err(RpcError::unknown_method(other)),
    };
    match reply {
        Ok(result) => IpcResponse::ok(req.id, result),
        Err(err) => IpcResponse::err(req.id, err),
    }
}

fn ping() -> Value {
    json!({
        "pong": true,
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
    })
}

fn list_tools() -> Value {
    let tools: Vec<Value> = TOOLS
        .iter()
        .map(|(name, description)| json!({"name": name, "description": description}))
        .collect();
    json!({ "tools": tools })
}

pub(crate) fn job_error(err: JobError) -> RpcError {
    let code = match &err {
        JobError::InvalidSpec(_) => RpcError::INVALID_PARAMS,
        JobError::NotFound(_) => CODE_NOT_FOUND,
        JobError::Expired { .. } => CODE_EXPIRED,
        JobError::AlreadyTerminal { .. } => CODE_JOB_TERMINAL,
        JobError::Capacity { .. } => CODE_CAPACITY,
    };
    RpcError::new(code, err.to_string())
}

fn job_id(params: &Value) -> Result<&str, RpcError> {
    params
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RpcError::invalid_params("`id` is required"))
}

fn to_value<T: serde::Serialize>(value: &T) -> Reply {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

fn submit_job(state: &AppState, params: Value) -> Reply {
    let job = state.orchestrator.submit(params).map_err(job_error)?;
    to_value(&job)
}

/// Always answers with an object: a snapshot for live jobs, otherwise the id
/// with status `expired` or `not_found`.
pub(crate) fn lookup_job(state: &AppState, id: &str) -> Reply {
    match state.orchestrator.status(id) {
        JobLookup::Found(job) => to_value(&*job),
        JobLookup::Expired { id, expired_at } => Ok(json!({
            "id": id,
            "status": "expired",
            "expired_at": expired_at,
        })),
        JobLookup::NotFound { id } => Ok(json!({
            "id": id,
            "status": CODE_NOT_FOUND,
        })),
    }
}

fn job_status(state: &AppState, params: &Value) -> Reply {
    lookup_job(state, job_id(params)?)
}

fn cancel_job(state: &AppState, params: &Value) -> Reply {
    let job = state
        .orchestrator
        .cancel(job_id(params)?)
        .map_err(job_error)?;
    to_value(&job)
}

pub(crate) fn list_jobs(state: &AppState) -> Value {
    let jobs = state.orchestrator.list();
    json!({
        "jobs": jobs,
        "active": state.orchestrator.active_count(),
    })
}

async fn list_scenes(state: &AppState) -> Reply {
    state
        .bridge
        .request("get_scene_list", json!({}), state.bridge_timeout())
        .await
        .map_err(|err| match err {
            BridgeError::Remote(msg) => RpcError::internal(msg),
            other => RpcError::new(CODE_BRIDGE_UNAVAILABLE, other.to_string()),
        })
}

async fn service_status(state: &AppState) -> Value {
    let healthy = state.service.is_healthy().await;
    json!({
        "service": {
            "base_url": state.service.base_url().as_str(),
            "healthy": healthy,
        },
        "bridge": {
            "state": state.bridge.state().as_str(),
            "transport": state.bridge.transport().map(|t| t.as_str()),
        },
        "jobs": {
            "active": state.orchestrator.active_count(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Config;

    fn state_for(base_url: &str, dir: &std::path::Path) -> AppState {
        let mut config = Config::default();
        config.service.base_url = base_url.to_string();
        config.service.probe_timeout_ms = 300;
        config.backend.state_dir = Some(dir.display().to_string());
        AppState::build(config).unwrap()
    }

    async fn call(state: &AppState, method: &str, params: Value) -> IpcResponse {
        dispatch(state, IpcRequest::new(method, Some(params))).await
    }

    #[tokio::test]
    async fn unknown_method_is_a_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("http://127.0.0.1:9", dir.path());
        let resp = call(&state, "teleport", json!({})).await;
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, RpcError::UNKNOWN_METHOD);
    }

    #[tokio::test]
    async fn list_tools_names_every_method() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("http://127.0.0.1:9", dir.path());
        let tools = call(&state, "list_tools", Value::Null)
            .await
            .into_result()
            .unwrap();
        let names: Vec<&str> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"submit_job"));
        assert!(names.contains(&"shutdown"));
        assert_eq!(names.len(), TOOLS.len());
    }

    #[tokio::test]
    async fn job_methods_map_errors_to_codes() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("http://127.0.0.1:9", dir.path());

        let bad = call(&state, "submit_job", json!({"prompt": "  "})).await;
        assert_eq!(bad.into_result().unwrap_err().code, RpcError::INVALID_PARAMS);

        let missing = call(&state, "job_status", json!({})).await;
        assert_eq!(missing.into_result().unwrap_err().code, RpcError::INVALID_PARAMS);

        let unknown = call(&state, "job_status", json!({"id": "nope"}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(unknown, json!({"id": "nope", "status": "not_found"}));
        let cancel_unknown = call(&state, "cancel_job", json!({"id": "nope"})).await;
        assert_eq!(cancel_unknown.into_result().unwrap_err().code, CODE_NOT_FOUND);

        let job = call(&state, "submit_job", json!({"prompt": "harbor district at dusk"}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(job["status"], "queued");
        let id = job["id"].as_str().unwrap().to_string();

        let cancelled = call(&state, "cancel_job", json!({"id": id}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(cancelled["status"], "cancelled");
        let again = call(&state, "cancel_job", json!({"id": id})).await;
        assert_eq!(again.into_result().unwrap_err().code, CODE_JOB_TERMINAL);

        let listed = call(&state, "list_jobs", json!({})).await.into_result().unwrap();
        assert_eq!(listed["jobs"][0]["id"], id.as_str());
        assert_eq!(listed["active"], 0);
        state.orchestrator.shutdown();
    }

    #[tokio::test]
    async fn expired_job_status_is_a_result_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("http://127.0.0.1:9", dir.path());
        let job = call(&state, "submit_job", json!({"prompt": "tide pools at noon"}))
            .await
            .into_result()
            .unwrap();
        let id = job["id"].as_str().unwrap().to_string();
        call(&state, "cancel_job", json!({"id": id}))
            .await
            .into_result()
            .unwrap();
        let swept = state
            .orchestrator
            .sweep_expired_at(chrono::Utc::now() + chrono::Duration::hours(3));
        assert_eq!(swept, vec![id.clone()]);

        let resp = call(&state, "job_status", json!({"id": id})).await;
        assert!(resp.error.is_none());
        let status = resp.into_result().unwrap();
        assert_eq!(status["id"], id.as_str());
        assert_eq!(status["status"], "expired");
        assert!(status["expired_at"].is_string());

        let again = call(&state, "cancel_job", json!({"id": id})).await;
        assert_eq!(again.into_result().unwrap_err().code, CODE_EXPIRED);
        state.orchestrator.shutdown();
    }

    #[tokio::test]
    async fn list_scenes_without_bridge_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("http://127.0.0.1:9", dir.path());
        let resp = call(&state, "list_scenes", json!({})).await;
        assert_eq!(resp.into_result().unwrap_err().code, CODE_BRIDGE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn service_status_reports_unreachable_service() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("http://127.0.0.1:9", dir.path());
        let status = call(&state, "service_status", json!({}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(status["service"]["healthy"], false);
        assert_eq!(status["bridge"]["state"], "disconnected");
        assert!(status["bridge"]["transport"].is_null());
    }

    #[tokio::test]
    async fn shutdown_cancels_the_server_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("http://127.0.0.1:9", dir.path());
        let resp = call(&state, "shutdown", json!({})).await;
        assert_eq!(resp.into_result().unwrap()["ok"], true);
        tokio::time::timeout(std::time::Duration::from_secs(2), state.shutdown.cancelled())
            .await
            .unwrap();
    }
}
