use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use kiln_bridge::Bridge;
use kiln_core::orchestrator::ArtifactRef;
use kiln_events::HandlerId;
use kiln_service::ServiceClient;
use kiln_topics::BRIDGE_EVENT_COMPLETE;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// What a completion event needs to become a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneRequest {
    pub job_id: String,
    pub artifact: ArtifactRef,
    pub prompt: Option<String>,
}

impl SceneRequest {
    /// Read a completed job snapshot. `None` when it carries no artifact.
    pub fn from_completion(data: &Value) -> Option<Self> {
        let job_id = data.get("id").and_then(Value::as_str)?.to_string();
        let first = data
            .pointer("/result/artifacts")
            .and_then(Value::as_array)
            .and_then(|a| a.first())?;
        let artifact: ArtifactRef = serde_json::from_value(first.clone()).ok()?;
        let prompt = data
            .pointer("/params/prompt")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            job_id,
            artifact,
            prompt,
        })
    }

    fn short_id(&self) -> &str {
        let end = self
            .job_id
            .char_indices()
            .nth(8)
            .map_or(self.job_id.len(), |(i, _)| i);
        &self.job_id[..end]
    }

    pub fn scene_name(&self) -> String {
        format!("kiln {}", self.short_id())
    }

    /// Local file name for the downloaded artifact; directory parts of the
    /// remote name are discarded.
    pub fn local_file_name(&self) -> String {
        let base = Path::new(&self.artifact.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "artifact.png".into());
        format!("{}_{}", self.short_id(), base)
    }
}

/// Turns completed jobs into scenes on the remote visual client.
#[derive(Clone)]
pub struct SceneDirector {
    service: ServiceClient,
    bridge: Bridge,
    outputs_dir: PathBuf,
    group: String,
    timeout: Duration,
}

impl SceneDirector {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            service: state.service.clone(),
            bridge: state.bridge.clone(),
            outputs_dir: state.outputs_dir(),
            group: state.config.bridge.scene_group.clone(),
            timeout: state.bridge_timeout(),
        }
    }

    /// Register on the bridge's `complete` event.
    pub fn install(self) -> HandlerId {
        let bridge = self.bridge.clone();
        bridge.on_event(BRIDGE_EVENT_COMPLETE, move |data| {
            let Some(req) = SceneRequest::from_completion(data) else {
                debug!(target: "kiln::scenes", "completion without artifact; no scene");
                return;
            };
            if !self.bridge.state().can_send() {
                debug!(target: "kiln::scenes", job = %req.job_id, "bridge offline; no scene");
                return;
            }
            let director = self.clone();
            tokio::spawn(async move {
                match director.present(&req).await {
                    Ok(scene) => info!(target: "kiln::scenes", job = %req.job_id, scene = %scene, "scene ready"),
                    Err(err) => {
                        warn!(target: "kiln::scenes", job = %req.job_id, error = %format!("{err:#}"), "scene creation failed")
                    }
                }
            });
        })
    }

    /// Make sure the group exists, download the artifact, create the scene
    /// and switch to it. Returns the scene name.
    pub async fn present(&self, req: &SceneRequest) -> anyhow::Result<String> {
        let created = self.ensure_group().await?;
        if created {
            info!(target: "kiln::scenes", group = %self.group, "created scene group");
        }
        let path = self.save_artifact(req).await?;
        let scene = req.scene_name();
        self.call(
            "create_scene",
            json!({
                "name": scene,
                "group": self.group,
                "image_path": path.display().to_string(),
                "prompt": req.prompt,
                "job_id": req.job_id,
            }),
        )
        .await?;
        self.call("set_current_scene", json!({ "name": scene })).await?;
        Ok(scene)
    }

    async fn save_artifact(&self, req: &SceneRequest) -> anyhow::Result<PathBuf> {
        let bytes = self
            .service
            .download(&req.artifact)
            .await
            .with_context(|| format!("downloading {}", req.artifact.filename))?;
        tokio::fs::create_dir_all(&self.outputs_dir)
            .await
            .with_context(|| format!("creating {}", self.outputs_dir.display()))?;
        let path = self.outputs_dir.join(req.local_file_name());
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(target: "kiln::scenes", path = %path.display(), bytes = bytes.len(), "artifact saved");
        Ok(path)
    }

    /// Idempotent: only creates the group when the listing lacks it.
    async fn ensure_group(&self) -> anyhow::Result<bool> {
        let listed = self.call("get_group_list", json!({})).await?;
        let exists = listed
            .get("groups")
            .and_then(Value::as_array)
            .is_some_and(|groups| {
                groups.iter().any(|g| {
                    g.as_str() == Some(self.group.as_str())
                        || g.get("name").and_then(Value::as_str) == Some(self.group.as_str())
                })
            });
        if exists {
            return Ok(false);
        }
        self.call("create_group", json!({ "name": self.group })).await?;
        Ok(true)
    }

    async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.bridge
            .request(method, params, self.timeout)
            .await
            .with_context(|| format!("bridge request `{method}`"))
    }
}
