use std::sync::Arc;
use std::time::Duration;

use kiln_core::orchestrator::{
    ArtifactRef, ExternalStatus, GenerationService, JobParams, ProgressRegistry,
};
use kiln_core::ServiceConfig;
use serde_json::{json, Value};
use url::Url;

use crate::workflow::{build_workflow, prompt_request};
use crate::ServiceError;

fn user_agent() -> String {
    format!("kiln/{}", env!("CARGO_PKG_VERSION"))
}

/// Ids currently held by the service's execution queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    // entries look like [number, prompt_id, prompt, extra, outputs]
    fn ids(list: Option<&Value>) -> Vec<String> {
        list.and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get(1).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn from_value(body: &Value) -> Self {
        Self {
            running: Self::ids(body.get("queue_running")),
            pending: Self::ids(body.get("queue_pending")),
        }
    }
}

/// HTTP client for the generation service.
///
/// Cheap to clone; clones share the connection pool and the progress
/// registry handed over by the orchestrator.
#[derive(Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    base: Url,
    cfg: Arc<ServiceConfig>,
    registry: Arc<ProgressRegistry>,
    client_id: String,
}

impl ServiceClient {
    pub fn new(
        cfg: &ServiceConfig,
        registry: Arc<ProgressRegistry>,
        client_id: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let mut raw = cfg.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|source| ServiceError::Url {
            url: cfg.base_url.clone(),
            source,
        })?;
        let http = reqwest::Client::builder()
            .user_agent(user_agent())
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_millis(cfg.request_timeout_ms.max(1)))
            .build()
            .map_err(|source| ServiceError::Http {
                endpoint: base.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base,
            cfg: Arc::new(cfg.clone()),
            registry,
            client_id: client_id.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.cfg
    }

    pub fn registry(&self) -> Arc<ProgressRegistry> {
        self.registry.clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|source| ServiceError::Url {
                url: format!("{}{path}", self.base),
                source,
            })
    }

    /// Push channel address: same host, `ws`/`wss` scheme, keyed by client id.
    pub fn ws_url(&self) -> Result<Url, ServiceError> {
        let mut url = self.endpoint("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        if url.set_scheme(scheme).is_err() {
            return Err(ServiceError::Malformed {
                endpoint: url.to_string(),
                detail: "cannot derive websocket url".into(),
            });
        }
        url.query_pairs_mut().append_pair("clientId", &self.client_id);
        Ok(url)
    }

    async fn send_json(
        &self,
        endpoint: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<Value, ServiceError> {
        let resp = self.send(endpoint, req).await?;
        let text = resp.text().await.map_err(|source| ServiceError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::Malformed {
            endpoint: endpoint.to_string(),
            detail: e.to_string(),
        })
    }

    async fn send(
        &self,
        endpoint: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ServiceError> {
        let resp = req.send().await.map_err(|source| ServiceError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Rejected {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    /// `POST /prompt`; returns the service's prompt id.
    pub async fn submit_workflow(&self, workflow: Value) -> Result<String, ServiceError> {
        let url = self.endpoint("prompt")?;
        let body = prompt_request(workflow, &self.client_id);
        let resp = self
            .send_json("/prompt", self.http.post(url).json(&body))
            .await?;
        resp.get("prompt_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Malformed {
                endpoint: "/prompt".into(),
                detail: format!("missing prompt_id in {resp}"),
            })
    }

    pub async fn queue(&self) -> Result<QueueSnapshot, ServiceError> {
        let url = self.endpoint("queue")?;
        let body = self.send_json("/queue", self.http.get(url)).await?;
        Ok(QueueSnapshot::from_value(&body))
    }

    /// History record for one prompt, `None` until the service has one.
    pub async fn history(&self, prompt_id: &str) -> Result<Option<Value>, ServiceError> {
        let url = self.endpoint(&format!("history/{prompt_id}"))?;
        let mut body = self.send_json("/history", self.http.get(url)).await?;
        Ok(body
            .get_mut(prompt_id)
            .map(Value::take)
            .filter(|v| !v.is_null()))
    }

    /// Queue first, then history.
    pub async fn poll(&self, prompt_id: &str) -> Result<ExternalStatus, ServiceError> {
        let queue = self.queue().await?;
        if queue.running.iter().any(|id| id == prompt_id) {
            return Ok(ExternalStatus::Running { step: None });
        }
        if queue.pending.iter().any(|id| id == prompt_id) {
            return Ok(ExternalStatus::Queued);
        }
        let Some(entry) = self.history(prompt_id).await? else {
            return Ok(ExternalStatus::Unknown);
        };
        Ok(status_from_history(&entry))
    }

    pub async fn artifacts(&self, prompt_id: &str) -> Result<Vec<ArtifactRef>, ServiceError> {
        Ok(self
            .history(prompt_id)
            .await?
            .map(|entry| artifacts_from_history(&entry))
            .unwrap_or_default())
    }

    /// `GET /view` for one artifact.
    pub async fn download(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ServiceError> {
        let mut url = self.endpoint("view")?;
        url.query_pairs_mut()
            .append_pair("filename", &artifact.filename)
            .append_pair("subfolder", &artifact.subfolder)
            .append_pair("type", &artifact.kind);
        let resp = self.send("/view", self.http.get(url)).await?;
        let bytes = resp.bytes().await.map_err(|source| ServiceError::Http {
            endpoint: "/view".into(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    /// Drop a pending prompt or interrupt the running one. `false` when the
    /// prompt is no longer queued at all.
    pub async fn cancel_prompt(&self, prompt_id: &str) -> Result<bool, ServiceError> {
        let queue = self.queue().await?;
        if queue.pending.iter().any(|id| id == prompt_id) {
            let url = self.endpoint("queue")?;
            self.send(
                "/queue",
                self.http.post(url).json(&json!({ "delete": [prompt_id] })),
            )
            .await?;
            return Ok(true);
        }
        if queue.running.iter().any(|id| id == prompt_id) {
            let url = self.endpoint("interrupt")?;
            self.send(
                "/interrupt",
                self.http.post(url).json(&json!({ "prompt_id": prompt_id })),
            )
            .await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn system_stats(&self) -> Result<Value, ServiceError> {
        let url = self.endpoint("system_stats")?;
        self.send_json(
            "/system_stats",
            self.http
                .get(url)
                .timeout(Duration::from_millis(self.cfg.probe_timeout_ms.max(1))),
        )
        .await
    }

    /// Liveness probe with the short probe timeout.
    pub async fn is_healthy(&self) -> bool {
        match self.system_stats().await {
            Ok(_) => true,
            Err(err) => {
                tracing::trace!(target: "kiln::service", error = %err, "liveness probe failed");
                false
            }
        }
    }
}

fn status_from_history(entry: &Value) -> ExternalStatus {
    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if status_str == "error" {
        return ExternalStatus::Failed {
            message: error_message(status).unwrap_or_else(|| "execution error".into()),
        };
    }
    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let has_outputs = entry
        .get("outputs")
        .and_then(Value::as_object)
        .is_some_and(|o| !o.is_empty());
    if completed || status_str == "success" || has_outputs {
        ExternalStatus::Complete
    } else {
        ExternalStatus::Unknown
    }
}

// messages: [["execution_error", {"exception_message": ..., "node_type": ...}], ...]
fn error_message(status: Option<&Value>) -> Option<String> {
    status?
        .get("messages")?
        .as_array()?
        .iter()
        .filter_map(Value::as_array)
        .find(|pair| pair.first().and_then(Value::as_str) == Some("execution_error"))
        .and_then(|pair| pair.get(1))
        .map(|data| {
            let msg = data
                .get("exception_message")
                .and_then(Value::as_str)
                .unwrap_or("execution error")
                .trim();
            match data.get("node_type").and_then(Value::as_str) {
                Some(node) => format!("{node}: {msg}"),
                None => msg.to_string(),
            }
        })
}

fn artifacts_from_history(entry: &Value) -> Vec<ArtifactRef> {
    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return Vec::new();
    };
    outputs
        .values()
        .filter_map(|node| node.get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|img| serde_json::from_value::<ArtifactRef>(img.clone()).ok())
        .filter(|a| a.kind == "output" && !a.filename.is_empty())
        .collect()
}

#[async_trait::async_trait]
impl GenerationService for ServiceClient {
    async fn submit(&self, params: &JobParams, client_id: &str) -> anyhow::Result<String> {
        if client_id != self.client_id {
            tracing::debug!(
                target: "kiln::service",
                expected = %self.client_id,
                got = %client_id,
                "submit with foreign client id; push events will not be routed"
            );
        }
        let workflow = build_workflow(params, &self.cfg);
        Ok(self.submit_workflow(workflow).await?)
    }

    async fn poll_status(&self, external_id: &str) -> anyhow::Result<ExternalStatus> {
        Ok(self.poll(external_id).await?)
    }

    async fn fetch_artifacts(&self, external_id: &str) -> anyhow::Result<Vec<ArtifactRef>> {
        Ok(self.artifacts(external_id).await?)
    }

    async fn download_artifact(&self, artifact: &ArtifactRef) -> anyhow::Result<Vec<u8>> {
        Ok(self.download(artifact).await?)
    }

    async fn interrupt(&self, external_id: &str) -> anyhow::Result<bool> {
        Ok(self.cancel_prompt(external_id).await?)
    }

    async fn health(&self) -> bool {
        self.is_healthy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_snapshot_reads_prompt_ids() {
        let q = QueueSnapshot::from_value(&json!({
            "queue_running": [[3, "p-3", {}, {}, ["9"]]],
            "queue_pending": [[4, "p-4", {}, {}, ["9"]], [5, "p-5"]],
            "extra": true
        }));
        assert_eq!(q.running, vec!["p-3"]);
        assert_eq!(q.pending, vec!["p-4", "p-5"]);
        assert_eq!(QueueSnapshot::from_value(&json!({})), QueueSnapshot::default());
    }

    #[test]
    fn history_error_surfaces_node_message() {
        let entry = json!({
            "outputs": {},
            "status": {
                "status_str": "error",
                "completed": false,
                "messages": [
                    ["execution_start", {"prompt_id": "p"}],
                    ["execution_error", {"node_type": "KSampler", "exception_message": "CUDA out of memory\n"}]
                ]
            }
        });
        assert_eq!(
            status_from_history(&entry),
            ExternalStatus::Failed {
                message: "KSampler: CUDA out of memory".into()
            }
        );
    }

    #[test]
    fn history_outputs_keep_only_saved_images() {
        let entry = json!({
            "outputs": {
                "9": {"images": [{"filename": "kiln_00001_.png", "subfolder": "", "type": "output"}]},
                "12": {"images": [{"filename": "preview.png", "subfolder": "", "type": "temp"}]},
                "13": {"text": ["not an image"]}
            },
            "status": {"status_str": "success", "completed": true}
        });
        assert_eq!(status_from_history(&entry), ExternalStatus::Complete);
        let artifacts = artifacts_from_history(&entry);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename, "kiln_00001_.png");
    }

    #[test]
    fn ws_url_mirrors_scheme() {
        let registry = Arc::new(ProgressRegistry::new());
        let cfg = ServiceConfig {
            base_url: "https://gpu.local:8443/comfy".into(),
            ..ServiceConfig::default()
        };
        let client = ServiceClient::new(&cfg, registry, "abc").unwrap();
        assert_eq!(
            client.ws_url().unwrap().as_str(),
            "wss://gpu.local:8443/comfy/ws?clientId=abc"
        );
    }
}
