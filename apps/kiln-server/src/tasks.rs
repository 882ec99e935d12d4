use std::borrow::Cow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Named background tasks owned by the backend for orderly shutdown.
#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }
}

#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_handle(&mut self, name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) {
        let task = TaskHandle::new(name, handle);
        trace!(target: "kiln::server", task = %task.name, "task registered");
        self.tasks.push(task);
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = TaskHandle>) {
        for task in tasks {
            trace!(target: "kiln::server", task = %task.name, "task registered");
            self.tasks.push(task);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Give each task up to `grace` to finish on its own, then abort it.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        for TaskHandle { name, mut handle } in self.tasks {
            if grace.is_zero() {
                handle.abort();
                let _ = handle.await;
                debug!(target: "kiln::server", task = %name, "task aborted");
                continue;
            }
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(_) => debug!(target: "kiln::server", task = %name, "task completed"),
                Err(_) => {
                    handle.abort();
                    let _ = handle.await;
                    debug!(target: "kiln::server", task = %name, "task aborted after grace period");
                }
            }
        }
    }
}
