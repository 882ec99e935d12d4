use super::types::{ArtifactRef, JobParams};

/// Coarse state of a job as reported by the generation service.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalStatus {
    Queued,
    Running { step: Option<(u32, u32)> },
    Complete,
    Failed { message: String },
    /// Neither queued nor in history (yet).
    Unknown,
}

/// The generation service as seen by the orchestrator.
#[async_trait::async_trait]
pub trait GenerationService: Send + Sync {
    /// Submit one job; returns the service's own job id.
    async fn submit(&self, params: &JobParams, client_id: &str) -> anyhow::Result<String>;
    async fn poll_status(&self, external_id: &str) -> anyhow::Result<ExternalStatus>;
    async fn fetch_artifacts(&self, external_id: &str) -> anyhow::Result<Vec<ArtifactRef>>;
    async fn download_artifact(&self, artifact: &ArtifactRef) -> anyhow::Result<Vec<u8>>;
    /// Best-effort stop; `false` when the service refused.
    async fn interrupt(&self, external_id: &str) -> anyhow::Result<bool>;
    async fn health(&self) -> bool;
}
