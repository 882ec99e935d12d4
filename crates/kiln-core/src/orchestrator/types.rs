use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_PROMPT_CHARS: usize = 2_000;
pub const MAX_STEPS: u32 = 150;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Generating,
    Processing,
    Complete,
    Failed,
    Expired,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Generating => "generating",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Expired | JobStatus::Cancelled
        )
    }

    // position along queued → generating → processing → complete
    fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Queued => Some(0),
            JobStatus::Generating => Some(1),
            JobStatus::Processing => Some(2),
            JobStatus::Complete => Some(3),
            _ => None,
        }
    }

    /// Allowed moves: forward along the main chain (a fast job may skip
    /// intermediate states), `failed`/`cancelled` from any live state,
    /// `expired` from anything not already expired.
    pub fn can_transition(&self, next: JobStatus) -> bool {
        match next {
            JobStatus::Expired => *self != JobStatus::Expired,
            JobStatus::Failed | JobStatus::Cancelled => !self.is_terminal(),
            _ => match (self.rank(), next.rank()) {
                (Some(from), Some(to)) => !self.is_terminal() && to > from,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl ImageSize {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "small" => Some(ImageSize::Small),
            "medium" => Some(ImageSize::Medium),
            "large" => Some(ImageSize::Large),
            _ => None,
        }
    }

    /// Square pixel dimensions of the latent canvas.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ImageSize::Small => (512, 512),
            ImageSize::Medium => (768, 768),
            ImageSize::Large => (1024, 1024),
        }
    }
}

/// Validated generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobParams {
    pub prompt: String,
    pub size: ImageSize,
    pub steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Generation request as received from a caller, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobSpec {
    pub fn from_value(value: Value) -> Result<Self, JobError> {
        serde_json::from_value(value).map_err(|e| JobError::InvalidSpec(e.to_string()))
    }

    pub fn validate(self, default_steps: u32) -> Result<JobParams, JobError> {
        let prompt = self
            .prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| JobError::InvalidSpec("prompt is required".into()))?;
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(JobError::InvalidSpec(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        let size = match self.size.as_deref() {
            None => ImageSize::default(),
            Some(raw) => ImageSize::parse(raw).ok_or_else(|| {
                JobError::InvalidSpec(format!(
                    "size must be one of small, medium, large (got `{raw}`)"
                ))
            })?,
        };
        let steps = self.steps.unwrap_or(default_steps);
        if !(1..=MAX_STEPS).contains(&steps) {
            return Err(JobError::InvalidSpec(format!(
                "steps must be between 1 and {MAX_STEPS}"
            )));
        }
        let negative_prompt = self
            .negative_prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        Ok(JobParams {
            prompt,
            size,
            steps,
            seed: self.seed,
            negative_prompt,
            extra: self.extra,
        })
    }
}

/// One output produced by the generation service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_artifact_kind")]
    pub kind: String,
}

fn default_artifact_kind() -> String {
    "output".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalJobHandle {
    pub external_id: String,
    pub client_correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    pub artifacts: Vec<ArtifactRef>,
}

/// Snapshot of one tracked job. Readers always receive clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_percent: u8,
    pub current_stage: String,
    pub params: JobParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalJobHandle>,
}

/// Outcome of a status query.
#[derive(Debug, Clone, PartialEq)]
pub enum JobLookup {
    Found(Box<Job>),
    Expired {
        id: String,
        expired_at: DateTime<Utc>,
    },
    NotFound {
        id: String,
    },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum JobError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {id} expired at {expired_at}")]
    Expired {
        id: String,
        expired_at: DateTime<Utc>,
    },
    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: String, status: JobStatus },
    #[error("job table is full ({limit} live jobs)")]
    Capacity { limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn main_chain_only_moves_forward() {
        assert!(JobStatus::Queued.can_transition(JobStatus::Generating));
        assert!(JobStatus::Generating.can_transition(JobStatus::Processing));
        assert!(JobStatus::Queued.can_transition(JobStatus::Complete));
        assert!(!JobStatus::Processing.can_transition(JobStatus::Generating));
        assert!(!JobStatus::Complete.can_transition(JobStatus::Complete));
    }

    #[test]
    fn terminal_states_only_expire() {
        for s in [JobStatus::Complete, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(!s.can_transition(JobStatus::Cancelled));
            assert!(!s.can_transition(JobStatus::Failed));
            assert!(s.can_transition(JobStatus::Expired));
        }
        assert!(!JobStatus::Expired.can_transition(JobStatus::Expired));
        assert!(JobStatus::Queued.can_transition(JobStatus::Cancelled));
    }

    #[test]
    fn spec_defaults_and_extras() {
        let spec = JobSpec::from_value(json!({
            "prompt": "  harbor district ",
            "style": "ink",
        }))
        .unwrap();
        let params = spec.validate(20).unwrap();
        assert_eq!(params.prompt, "harbor district");
        assert_eq!(params.size, ImageSize::Medium);
        assert_eq!(params.steps, 20);
        assert_eq!(params.extra.get("style"), Some(&json!("ink")));
    }

    #[test]
    fn spec_rejects_bad_input() {
        let cases = [
            json!({}),
            json!({"prompt": "   "}),
            json!({"prompt": "x", "size": "huge"}),
            json!({"prompt": "x", "steps": 0}),
            json!({"prompt": "x", "steps": 151}),
            json!({"prompt": "x".repeat(MAX_PROMPT_CHARS + 1)}),
        ];
        for case in cases {
            let res = JobSpec::from_value(case.clone()).and_then(|s| s.validate(20));
            assert!(
                matches!(res, Err(JobError::InvalidSpec(_))),
                "accepted {case}"
            );
        }
        assert!(JobSpec::from_value(json!({"prompt": "x", "steps": "many"})).is_err());
    }

    #[test]
    fn artifact_tolerates_missing_optional_fields() {
        let a: ArtifactRef =
            serde_json::from_value(json!({"filename": "kiln_0001.png", "extra": 1})).unwrap();
        assert_eq!(a.subfolder, "");
        assert_eq!(a.kind, "output");
    }
}
