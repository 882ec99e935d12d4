use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_events::Bus;
use kiln_topics as topics;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::progress::{estimate_percent, step_percent, ProgressRegistry, ProgressUpdate};
use super::service::{ExternalStatus, GenerationService};
use super::types::{
    ExternalJobHandle, Job, JobError, JobLookup, JobResult, JobSpec, JobStatus,
};
use crate::{Backoff, Config};

pub const STAGE_QUEUED: &str = "queued";
pub const STAGE_SUBMITTING: &str = "submitting";
pub const STAGE_WAITING: &str = "waiting for worker";
pub const STAGE_ESTIMATED: &str = "sampling (estimated)";
pub const STAGE_DECODING: &str = "decoding and saving";
pub const STAGE_DONE: &str = "done";
pub const STAGE_FAILED: &str = "failed";
pub const STAGE_CANCELLED: &str = "cancelled";
pub const STAGE_EXPIRED: &str = "expired";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_jobs: usize,
    pub retention: Duration,
    pub stale_after: Duration,
    pub poll_interval: Duration,
    pub submit_backoff: Backoff,
    pub default_steps: u32,
    pub per_step_estimate: Duration,
}

impl OrchestratorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let jobs = &cfg.jobs;
        Self {
            max_jobs: jobs.max_jobs.max(1),
            retention: Duration::from_secs(jobs.retention_secs),
            stale_after: Duration::from_secs(jobs.stale_after_secs),
            poll_interval: Duration::from_millis(jobs.poll_interval_ms.max(10)),
            submit_backoff: cfg.job_submit_backoff(),
            default_steps: jobs.default_steps,
            per_step_estimate: Duration::from_millis(jobs.per_step_estimate_ms),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Tracks generation jobs from submission to a terminal state.
///
/// The job table lives behind a synchronous mutex that is never held across
/// an await; callers only ever see cloned snapshots.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    service: Arc<dyn GenerationService>,
    registry: Arc<ProgressRegistry>,
    bus: Bus,
    cfg: OrchestratorConfig,
    client_id: String,
    table: Mutex<JobTable>,
    shutdown: CancellationToken,
}

struct Entry {
    job: Job,
    // a real step counter has arrived; estimates stop
    push_seen: bool,
}

impl Entry {
    fn mark_started(&mut self, now: DateTime<Utc>) {
        if self.job.status.can_transition(JobStatus::Generating) {
            self.job.status = JobStatus::Generating;
            self.job.current_stage = STAGE_ESTIMATED.into();
        }
        if self.job.started_at.is_none() {
            self.job.started_at = Some(now);
        }
    }

    fn raise_progress(&mut self, pct: u8) -> bool {
        if pct > self.job.progress_percent {
            self.job.progress_percent = pct;
            return true;
        }
        false
    }

    fn finish(&mut self, status: JobStatus, now: DateTime<Utc>, stage: &str) {
        self.job.status = status;
        self.job.completed_at = Some(now);
        self.job.current_stage = stage.into();
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, Entry>,
    // expired ids are kept for the life of the process
    tombstones: HashMap<String, DateTime<Utc>>,
}

impl JobTable {
    /// Drop a job from the live table and remember when it went.
    fn expire(&mut self, id: &str, now: DateTime<Utc>) -> Option<(JobStatus, Job)> {
        let mut entry = self.jobs.remove(id)?;
        let previous = entry.job.status;
        entry.job.status = JobStatus::Expired;
        entry.job.current_stage = STAGE_EXPIRED.into();
        if entry.job.completed_at.is_none() {
            entry.job.completed_at = Some(now);
        }
        self.tombstones.insert(id.to_string(), now);
        Some((previous, entry.job))
    }
}

type Event = (&'static str, Value);

fn snapshot_event(kind: &'static str, job: &Job) -> Event {
    (kind, serde_json::to_value(job).unwrap_or(Value::Null))
}

fn progress_event(job: &Job) -> Event {
    (
        topics::TOPIC_JOB_PROGRESS,
        json!({
            "id": job.id,
            "status": job.status,
            "progress_percent": job.progress_percent,
            "stage": job.current_stage,
        }),
    )
}

fn expired_event(previous: JobStatus, job: &Job) -> Event {
    (
        topics::TOPIC_JOB_EXPIRED,
        json!({
            "id": job.id,
            "previous_status": previous,
            "expired_at": job.completed_at,
        }),
    )
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn deadline_passed(from: DateTime<Utc>, after: Duration, now: DateTime<Utc>) -> bool {
    from.checked_add_signed(chrono_duration(after))
        .is_some_and(|deadline| deadline <= now)
}

impl JobOrchestrator {
    pub fn new(
        service: Arc<dyn GenerationService>,
        registry: Arc<ProgressRegistry>,
        bus: Bus,
        cfg: OrchestratorConfig,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                registry,
                bus,
                cfg,
                client_id: client_id.into(),
                table: Mutex::new(JobTable::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> Arc<ProgressRegistry> {
        self.inner.registry.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Validate and accept a job. Returns at once with the job `queued`;
    /// submission to the service continues in the background.
    pub fn submit(&self, spec: Value) -> Result<Job, JobError> {
        let params = JobSpec::from_value(spec)?.validate(self.inner.cfg.default_steps)?;
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            progress_percent: 0,
            current_stage: STAGE_QUEUED.into(),
            params,
            result: None,
            error: None,
            attempts: 0,
            max_attempts: self.inner.cfg.submit_backoff.max_attempts,
            external: None,
        };
        let mut events = Vec::new();
        {
            let mut table = self.inner.lock_table();
            if table.jobs.len() >= self.inner.cfg.max_jobs {
                let victim = table
                    .jobs
                    .values()
                    .filter(|e| e.job.status.is_terminal())
                    .min_by_key(|e| e.job.completed_at.unwrap_or(e.job.created_at))
                    .map(|e| e.job.id.clone());
                let Some(victim) = victim else {
                    return Err(JobError::Capacity {
                        limit: self.inner.cfg.max_jobs,
                    });
                };
                if let Some((previous, gone)) = table.expire(&victim, now) {
                    events.push(expired_event(previous, &gone));
                }
            }
            table.jobs.insert(
                job.id.clone(),
                Entry {
                    job: job.clone(),
                    push_seen: false,
                },
            );
        }
        events.push(snapshot_event(topics::TOPIC_JOB_CREATED, &job));
        self.inner.publish_all(events);
        info!(
            target: "kiln::jobs",
            job = %job.id,
            size = ?job.params.size,
            steps = job.params.steps,
            "job queued"
        );

        let inner = self.inner.clone();
        let id = job.id.clone();
        tokio::spawn(async move {
            inner.run_submission(id).await;
        });
        Ok(job)
    }

    pub fn status(&self, id: &str) -> JobLookup {
        let table = self.inner.lock_table();
        if let Some(entry) = table.jobs.get(id) {
            return JobLookup::Found(Box::new(entry.job.clone()));
        }
        match table.tombstones.get(id) {
            Some(at) => JobLookup::Expired {
                id: id.to_string(),
                expired_at: *at,
            },
            None => JobLookup::NotFound { id: id.to_string() },
        }
    }

    /// Cancel locally and ask the service to stop. The local state change
    /// stands whatever the service answers.
    pub fn cancel(&self, id: &str) -> Result<Job, JobError> {
        let now = Utc::now();
        let (snapshot, external) = {
            let mut table = self.inner.lock_table();
            let tombstone = table.tombstones.get(id).copied();
            let Some(entry) = table.jobs.get_mut(id) else {
                return Err(match tombstone {
                    Some(expired_at) => JobError::Expired {
                        id: id.to_string(),
                        expired_at,
                    },
                    None => JobError::NotFound(id.to_string()),
                });
            };
            if entry.job.status.is_terminal() {
                return Err(JobError::AlreadyTerminal {
                    id: id.to_string(),
                    status: entry.job.status,
                });
            }
            entry.finish(JobStatus::Cancelled, now, STAGE_CANCELLED);
            (entry.job.clone(), entry.job.external.clone())
        };
        if let Some(handle) = &external {
            self.inner.registry.unregister(&handle.external_id);
            self.inner.spawn_interrupt(handle.external_id.clone());
        }
        self.inner
            .publish_all(vec![snapshot_event(topics::TOPIC_JOB_CANCELLED, &snapshot)]);
        info!(target: "kiln::jobs", job = %id, "job cancelled");
        Ok(snapshot)
    }

    /// Live jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        let table = self.inner.lock_table();
        let mut jobs: Vec<Job> = table.jobs.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock_table()
            .jobs
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .count()
    }

    /// Ask the service about every live job it knows and feed the answers
    /// through the progress table. Returns how many jobs were polled.
    pub async fn poll_once(&self) -> usize {
        let targets: Vec<(String, String)> = {
            let table = self.inner.lock_table();
            table
                .jobs
                .values()
                .filter(|e| !e.job.status.is_terminal())
                .filter_map(|e| {
                    e.job
                        .external
                        .as_ref()
                        .map(|h| (e.job.id.clone(), h.external_id.clone()))
                })
                .collect()
        };
        let registry = &self.inner.registry;
        for (job_id, external_id) in &targets {
            match self.inner.service.poll_status(external_id).await {
                Ok(ExternalStatus::Queued) | Ok(ExternalStatus::Unknown) => {}
                Ok(ExternalStatus::Running { step }) => {
                    registry.dispatch(external_id, ProgressUpdate::Running);
                    if let Some((value, max)) = step {
                        registry.dispatch(external_id, ProgressUpdate::Step { value, max });
                    }
                }
                Ok(ExternalStatus::Complete) => {
                    match self.inner.service.fetch_artifacts(external_id).await {
                        Ok(artifacts) => {
                            registry.dispatch(external_id, ProgressUpdate::Finished { artifacts });
                        }
                        Err(err) => warn!(
                            target: "kiln::jobs",
                            job = %job_id,
                            error = %err,
                            "artifact lookup failed; retrying next poll"
                        ),
                    }
                }
                Ok(ExternalStatus::Failed { message }) => {
                    registry.dispatch(external_id, ProgressUpdate::Failed { message });
                }
                Err(err) => {
                    debug!(target: "kiln::jobs", job = %job_id, error = %err, "poll failed");
                }
            }
        }
        targets.len()
    }

    /// Advance time-based estimates for jobs without a step counter.
    pub fn tick_estimates_at(&self, now: DateTime<Utc>) -> usize {
        let per_step = self.inner.cfg.per_step_estimate;
        let mut events = Vec::new();
        {
            let mut table = self.inner.lock_table();
            for entry in table.jobs.values_mut() {
                if entry.job.status != JobStatus::Generating || entry.push_seen {
                    continue;
                }
                let Some(started) = entry.job.started_at else {
                    continue;
                };
                let elapsed = (now - started).to_std().unwrap_or_default();
                let pct = estimate_percent(elapsed, entry.job.params.steps, per_step);
                if entry.raise_progress(pct) {
                    entry.job.current_stage = STAGE_ESTIMATED.into();
                    events.push(progress_event(&entry.job));
                }
            }
        }
        let n = events.len();
        self.inner.publish_all(events);
        n
    }

    /// Expire terminal jobs past retention and live jobs past the stale
    /// deadline. Returns the expired ids.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let cfg = &self.inner.cfg;
        let mut events = Vec::new();
        let mut interrupts = Vec::new();
        let mut expired_ids = Vec::new();
        {
            let mut table = self.inner.lock_table();
            let due: Vec<String> = table
                .jobs
                .values()
                .filter(|e| {
                    let job = &e.job;
                    if job.status.is_terminal() {
                        job.completed_at
                            .is_some_and(|t| deadline_passed(t, cfg.retention, now))
                    } else {
                        deadline_passed(job.created_at, cfg.stale_after, now)
                    }
                })
                .map(|e| e.job.id.clone())
                .collect();
            for id in due {
                if let Some((previous, job)) = table.expire(&id, now) {
                    if !previous.is_terminal() {
                        if let Some(h) = &job.external {
                            interrupts.push(h.external_id.clone());
                        }
                    }
                    events.push(expired_event(previous, &job));
                    expired_ids.push(id);
                }
            }
        }
        for external_id in interrupts {
            self.inner.registry.unregister(&external_id);
            self.inner.spawn_interrupt(external_id);
        }
        if !expired_ids.is_empty() {
            debug!(target: "kiln::jobs", count = expired_ids.len(), "expired jobs");
        }
        self.inner.publish_all(events);
        expired_ids
    }

    /// Poll, estimate and sweep on the configured interval until
    /// [`JobOrchestrator::shutdown`].
    pub fn spawn_background(&self) -> JoinHandle<()> {
        let this = self.clone();
        let token = self.inner.shutdown.clone();
        let period = self.inner.cfg.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                this.poll_once().await;
                let now = Utc::now();
                this.tick_estimates_at(now);
                this.sweep_expired_at(now);
            }
            debug!(target: "kiln::jobs", "job poller stopped");
        })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn lock_table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_all(&self, events: Vec<Event>) {
        for (kind, payload) in events {
            self.bus.publish(kind, &payload);
        }
    }

    fn spawn_interrupt(&self, external_id: String) {
        let service = self.service.clone();
        tokio::spawn(async move {
            match service.interrupt(&external_id).await {
                Ok(true) => debug!(target: "kiln::jobs", external_id = %external_id, "interrupt sent"),
                Ok(false) => {
                    warn!(target: "kiln::jobs", external_id = %external_id, "service declined interrupt")
                }
                Err(err) => {
                    warn!(target: "kiln::jobs", external_id = %external_id, error = %err, "interrupt failed")
                }
            }
        });
    }

    async fn run_submission(self: Arc<Self>, job_id: String) {
        let backoff = self.cfg.submit_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let params = {
                let mut table = self.lock_table();
                let Some(entry) = table.jobs.get_mut(&job_id) else {
                    return;
                };
                if entry.job.status != JobStatus::Queued {
                    return;
                }
                entry.job.attempts = attempt;
                entry.job.current_stage = STAGE_SUBMITTING.into();
                entry.job.params.clone()
            };
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                res = self.service.submit(&params, &self.client_id) => res,
            };
            match outcome {
                Ok(external_id) => {
                    self.attach_external(&job_id, external_id);
                    return;
                }
                Err(err) if backoff.allows(attempt + 1) => {
                    let delay = backoff.delay_for(attempt - 1);
                    warn!(
                        target: "kiln::jobs",
                        job = %job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "submit failed; retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    self.fail_job(
                        &job_id,
                        format!("submission failed after {attempt} attempts: {err:#}"),
                    );
                    return;
                }
            }
        }
    }

    fn attach_external(self: &Arc<Self>, job_id: &str, external_id: String) {
        let handle = ExternalJobHandle {
            external_id: external_id.clone(),
            client_correlation_id: self.client_id.clone(),
        };
        let attached = {
            let mut table = self.lock_table();
            match table.jobs.get_mut(job_id) {
                Some(entry) if !entry.job.status.is_terminal() => {
                    let weak = Arc::downgrade(self);
                    let id = job_id.to_string();
                    let registered = self.registry.register(
                        &external_id,
                        Arc::new(move |update| {
                            if let Some(inner) = weak.upgrade() {
                                inner.apply_update(&id, update);
                            }
                        }),
                    );
                    if registered {
                        entry.job.external = Some(handle);
                        entry.job.current_stage = STAGE_WAITING.into();
                    }
                    Some(registered)
                }
                _ => None,
            }
        };
        match attached {
            Some(true) => {
                info!(target: "kiln::jobs", job = %job_id, external_id = %external_id, "job submitted")
            }
            Some(false) => self.fail_job(
                job_id,
                format!("service id {external_id} is already tracked by another job"),
            ),
            None => {
                // cancelled or expired while the submit was in flight
                self.spawn_interrupt(external_id);
            }
        }
    }

    fn fail_job(&self, job_id: &str, message: String) {
        let now = Utc::now();
        let failed = {
            let mut table = self.lock_table();
            match table.jobs.get_mut(job_id) {
                Some(entry) if !entry.job.status.is_terminal() => {
                    entry.job.error = Some(message.clone());
                    entry.finish(JobStatus::Failed, now, STAGE_FAILED);
                    Some(entry.job.clone())
                }
                _ => None,
            }
        };
        if let Some(job) = failed {
            if let Some(h) = &job.external {
                self.registry.unregister(&h.external_id);
            }
            warn!(target: "kiln::jobs", job = %job_id, error = %message, "job failed");
            self.publish_all(vec![snapshot_event(topics::TOPIC_JOB_FAILED, &job)]);
        }
    }

    /// Single entry point for push and poll signals.
    fn apply_update(&self, job_id: &str, update: ProgressUpdate) {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut release = None;
        {
            let mut table = self.lock_table();
            let Some(entry) = table.jobs.get_mut(job_id) else {
                return;
            };
            if entry.job.status.is_terminal() {
                debug!(
                    target: "kiln::jobs",
                    job = %job_id,
                    status = %entry.job.status,
                    "ignoring update for finished job"
                );
                return;
            }
            match update {
                ProgressUpdate::Running => {
                    if entry.job.status == JobStatus::Queued {
                        entry.mark_started(now);
                        events.push(progress_event(&entry.job));
                    }
                }
                ProgressUpdate::Step { value, max } => {
                    entry.push_seen = true;
                    entry.mark_started(now);
                    entry.raise_progress(step_percent(value, max));
                    if max > 0 && value >= max {
                        if entry.job.status.can_transition(JobStatus::Processing) {
                            entry.job.status = JobStatus::Processing;
                        }
                        entry.job.current_stage = STAGE_DECODING.into();
                    } else {
                        entry.job.current_stage = format!("sampling step {value}/{max}");
                    }
                    events.push(progress_event(&entry.job));
                }
                ProgressUpdate::Finished { artifacts } if artifacts.is_empty() => {
                    entry.job.error =
                        Some("service finished without producing an artifact".into());
                    entry.finish(JobStatus::Failed, now, STAGE_FAILED);
                    release = entry.job.external.clone();
                    events.push(snapshot_event(topics::TOPIC_JOB_FAILED, &entry.job));
                }
                ProgressUpdate::Finished { artifacts } => {
                    entry.job.progress_percent = 100;
                    entry.job.result = Some(JobResult { artifacts });
                    entry.finish(JobStatus::Complete, now, STAGE_DONE);
                    release = entry.job.external.clone();
                    events.push(snapshot_event(topics::TOPIC_JOB_COMPLETED, &entry.job));
                }
                ProgressUpdate::Failed { message } => {
                    entry.job.error = Some(message);
                    entry.finish(JobStatus::Failed, now, STAGE_FAILED);
                    release = entry.job.external.clone();
                    events.push(snapshot_event(topics::TOPIC_JOB_FAILED, &entry.job));
                }
            }
        }
        if let Some(handle) = release {
            self.registry.unregister(&handle.external_id);
            info!(target: "kiln::jobs", job = %job_id, "job finished");
        }
        self.publish_all(events);
    }
}
