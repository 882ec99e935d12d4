use std::time::Duration;

use futures_util::StreamExt;
use kiln_core::orchestrator::ProgressUpdate;
use kiln_core::Backoff;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{ServiceClient, ServiceError};

/// What one push message means for the prompt it names.
#[derive(Debug, Clone, PartialEq)]
pub enum PushSignal {
    Update(ProgressUpdate),
    /// Execution ended; artifacts still have to be looked up.
    Done,
}

/// Map a push message to `(prompt_id, signal)`. Messages without a prompt
/// id, or of kinds that carry no job state, yield `None`.
pub fn classify_push(msg: &Value) -> Option<(String, PushSignal)> {
    let kind = msg.get("type")?.as_str()?;
    let data = msg.get("data")?;
    let prompt_id = data.get("prompt_id")?.as_str()?.to_string();
    let signal = match kind {
        "progress" => {
            let value = data.get("value")?.as_u64()?;
            let max = data.get("max")?.as_u64()?;
            PushSignal::Update(ProgressUpdate::Step {
                value: u32::try_from(value).ok()?,
                max: u32::try_from(max).ok()?,
            })
        }
        "execution_start" => PushSignal::Update(ProgressUpdate::Running),
        "executing" => match data.get("node") {
            Some(Value::Null) | None => PushSignal::Done,
            Some(_) => PushSignal::Update(ProgressUpdate::Running),
        },
        "execution_success" => PushSignal::Done,
        "execution_error" => {
            let message = data
                .get("exception_message")
                .and_then(Value::as_str)
                .unwrap_or("execution error")
                .trim()
                .to_string();
            PushSignal::Update(ProgressUpdate::Failed { message })
        }
        "execution_interrupted" => PushSignal::Update(ProgressUpdate::Failed {
            message: "interrupted".into(),
        }),
        _ => return None,
    };
    Some((prompt_id, signal))
}

/// Background websocket subscription feeding the shared progress registry.
///
/// Reconnects after drops with the given backoff, holding at its cap for as
/// long as the service stays away; polling covers the gap.
pub struct PushSubscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PushSubscription {
    pub fn spawn(client: ServiceClient, backoff: Backoff) -> Result<Self, ServiceError> {
        let url = client.ws_url()?;
        Ok(Self::spawn_at(client, url, backoff))
    }

    pub fn spawn_at(client: ServiceClient, url: Url, backoff: Backoff) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(client, url, backoff, token.clone()));
        Self { token, handle }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn join(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(target: "kiln::service", error = %err, "push task ended abnormally");
        }
    }
}

async fn run(client: ServiceClient, url: Url, backoff: Backoff, token: CancellationToken) {
    let mut failures: u32 = 0;
    loop {
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            res = connect_async(url.as_str()) => res,
        };
        match connected {
            Ok((mut ws, _resp)) => {
                failures = 0;
                info!(target: "kiln::service", url = %url, "push channel connected");
                loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => {
                            let _ = ws.close(None).await;
                            return;
                        }
                        msg = ws.next() => msg,
                    };
                    match next {
                        Some(Ok(Message::Text(text))) => handle_text(&client, text.as_str()).await,
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(target: "kiln::service", "push channel closed");
                            break;
                        }
                        // preview frames and control frames
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!(target: "kiln::service", error = %err, "push channel error");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                if failures == 1 {
                    warn!(target: "kiln::service", url = %url, error = %err, "push channel unavailable");
                } else {
                    debug!(target: "kiln::service", attempt = failures, error = %err, "push reconnect failed");
                }
            }
        }
        let delay = backoff.delay_for(failures.saturating_sub(1));
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay.max(Duration::from_millis(10))) => {}
        }
    }
}

async fn handle_text(client: &ServiceClient, text: &str) {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        debug!(target: "kiln::service", "ignoring non-json push frame");
        return;
    };
    let Some((prompt_id, signal)) = classify_push(&msg) else {
        return;
    };
    let registry = client.registry();
    match signal {
        PushSignal::Update(update) => {
            registry.dispatch(&prompt_id, update);
        }
        PushSignal::Done => {
            if !registry.contains(&prompt_id) {
                return;
            }
            // an empty list here can mean history is not written yet; the
            // poller settles that case
            match client.artifacts(&prompt_id).await {
                Ok(artifacts) if !artifacts.is_empty() => {
                    registry.dispatch(&prompt_id, ProgressUpdate::Finished { artifacts });
                }
                Ok(_) => {
                    debug!(target: "kiln::service", prompt_id = %prompt_id, "no artifacts yet");
                }
                Err(err) => {
                    debug!(target: "kiln::service", prompt_id = %prompt_id, error = %err, "artifact lookup failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_maps_to_step() {
        let msg = json!({"type": "progress", "data": {"value": 4, "max": 20, "prompt_id": "p", "node": "3"}});
        assert_eq!(
            classify_push(&msg),
            Some((
                "p".into(),
                PushSignal::Update(ProgressUpdate::Step { value: 4, max: 20 })
            ))
        );
    }

    #[test]
    fn executing_null_node_means_done() {
        let done = json!({"type": "executing", "data": {"node": null, "prompt_id": "p"}});
        let busy = json!({"type": "executing", "data": {"node": "8", "prompt_id": "p"}});
        assert_eq!(classify_push(&done), Some(("p".into(), PushSignal::Done)));
        assert_eq!(
            classify_push(&busy),
            Some(("p".into(), PushSignal::Update(ProgressUpdate::Running)))
        );
    }

    #[test]
    fn status_and_unroutable_messages_are_skipped() {
        assert_eq!(
            classify_push(&json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}}})),
            None
        );
        assert_eq!(
            classify_push(&json!({"type": "progress", "data": {"value": 1, "max": 2}})),
            None
        );
    }

    #[test]
    fn execution_error_carries_message() {
        let msg = json!({"type": "execution_error", "data": {"prompt_id": "p", "exception_message": " boom "}});
        assert_eq!(
            classify_push(&msg),
            Some((
                "p".into(),
                PushSignal::Update(ProgressUpdate::Failed {
                    message: "boom".into()
                })
            ))
        );
    }
}
