mod dispatch;
#[cfg(any(test, feature = "test_support"))]
pub mod test_support;

pub use dispatch::{Dispatcher, EventHandler, HandlerId};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// A simple broadcast bus for JSON-serializable events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        if self
            .tx
            .send(Envelope {
                time: now,
                kind: kind.to_string(),
                payload: val,
            })
            .is_err()
        {
            tracing::trace!(kind, "event published with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("job.created", &json!({"id": "a"}));
        bus.publish("job.progress", &json!({"id": "a", "percent": 10}));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, "job.created");
        assert_eq!(second.payload["percent"], 10);
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = Bus::new(1);
        bus.publish("job.created", &json!({}));
        assert_eq!(bus.receiver_count(), 0);
    }
}
