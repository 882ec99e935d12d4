use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

/// Handler invoked synchronously for every event of the kind it was
/// registered under.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registration so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Explicit event-kind → handlers table.
///
/// Handlers run inside the call to [`Dispatcher::dispatch`], in
/// registration order. The table is cloned out before invocation so a
/// handler may register or remove handlers without deadlocking.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut map = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, kind: &str, id: HandlerId) -> bool {
        let mut map = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = map.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(kind);
        }
        removed
    }

    pub fn has_handlers(&self, kind: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .is_some_and(|list| !list.is_empty())
    }

    /// Invoke every handler registered for `kind`; returns how many ran.
    pub fn dispatch(&self, kind: &str, payload: &Value) -> usize {
        let handlers: Vec<EventHandler> = {
            let map = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match map.get(kind) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => Vec::new(),
            }
        };
        if handlers.is_empty() {
            tracing::debug!(kind, "no handlers registered for event");
        }
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }
}
