use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::types::ArtifactRef;

/// Ceiling for any progress value reported before a terminal state.
pub const MAX_LIVE_PERCENT: u8 = 99;

/// Signal from either the push channel or the poller for one external job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Sampler step counter.
    Step { value: u32, max: u32 },
    /// The service picked the job up.
    Running,
    Finished { artifacts: Vec<ArtifactRef> },
    Failed { message: String },
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Callback table keyed by the service's job id.
///
/// Owned by the orchestrator and shared with the service client, so push
/// events and poll results reach the same handler. One callback per
/// external id.
#[derive(Default)]
pub struct ProgressRegistry {
    callbacks: Mutex<HashMap<String, ProgressCallback>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` without replacing anything when the id is taken.
    pub fn register(&self, external_id: &str, callback: ProgressCallback) -> bool {
        let mut map = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(external_id) {
            return false;
        }
        map.insert(external_id.to_string(), callback);
        true
    }

    pub fn unregister(&self, external_id: &str) -> bool {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(external_id)
            .is_some()
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(external_id)
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke the callback for `external_id`, if any. The table lock is
    /// released before the callback runs.
    pub fn dispatch(&self, external_id: &str, update: ProgressUpdate) -> bool {
        let callback = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(external_id)
            .cloned();
        match callback {
            Some(cb) => {
                cb(update);
                true
            }
            None => {
                tracing::trace!(target: "kiln::jobs", external_id, "progress for untracked job");
                false
            }
        }
    }
}

/// Percent from a sampler step counter, held below 100 until the job is
/// actually complete.
pub fn step_percent(value: u32, max: u32) -> u8 {
    if max == 0 {
        return 0;
    }
    let pct = (u64::from(value.min(max)) * 100) / u64::from(max);
    (pct as u8).min(MAX_LIVE_PERCENT)
}

/// Time-based approximation: elapsed time over `steps * per_step`.
///
/// Only meaningful while no push signal has been seen; hardware speed varies
/// so this is never treated as exact.
pub fn estimate_percent(elapsed: Duration, steps: u32, per_step: Duration) -> u8 {
    let total = per_step.as_secs_f64() * f64::from(steps.max(1));
    if total <= 0.0 {
        return 0;
    }
    let pct = (elapsed.as_secs_f64() / total * 100.0).floor();
    if !pct.is_finite() || pct < 0.0 {
        return 0;
    }
    pct.min(f64::from(MAX_LIVE_PERCENT)) as u8
}
