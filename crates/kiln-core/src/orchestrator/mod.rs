mod manager;
mod progress;
mod service;
mod types;

pub use manager::{JobOrchestrator, OrchestratorConfig};
pub use progress::{
    estimate_percent, step_percent, ProgressCallback, ProgressRegistry, ProgressUpdate,
    MAX_LIVE_PERCENT,
};
pub use service::{ExternalStatus, GenerationService};
pub use types::{
    ArtifactRef, ExternalJobHandle, ImageSize, Job, JobError, JobLookup, JobParams, JobResult,
    JobSpec, JobStatus, MAX_PROMPT_CHARS, MAX_STEPS,
};
