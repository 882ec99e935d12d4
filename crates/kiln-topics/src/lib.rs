//! Canonical event kinds shared across the backend.
//!
//! Job topics are published on the in-process bus by the orchestrator;
//! bridge kinds name the envelope events relayed to the remote client.
//! Keep this list alphabetized within sections and favor dot.case names.

// Jobs
pub const TOPIC_JOB_CANCELLED: &str = "job.cancelled";
pub const TOPIC_JOB_COMPLETED: &str = "job.completed";
pub const TOPIC_JOB_CREATED: &str = "job.created";
pub const TOPIC_JOB_EXPIRED: &str = "job.expired";
pub const TOPIC_JOB_FAILED: &str = "job.failed";
pub const TOPIC_JOB_PROGRESS: &str = "job.progress";

// Bridge events (remote visual client)
pub const BRIDGE_EVENT_COMPLETE: &str = "complete";
pub const BRIDGE_EVENT_PROGRESS: &str = "progress";
