//! Reply dispatcher (SPEC_FULL §10.6): a process-local broadcast point for
//! the reply queue, used two ways — routing replies addressed to a process
//! instance into `ProcessManager::on_reply` (spec §4.5 `onReply`), and
//! letting a synchronous `sync_wait > 0` caller subscribe to a single
//! command's reply instead of polling the Command row (spec §9 Open
//! Questions: "implementers may offer it ... via ... subscribing to a local
//! reply dispatcher").
//!
//! Grounded on `worker::spawn_consumer`'s subscribe-then-`stream.next()`
//! task shape, reused here for the reply queue rather than a command queue,
//! and on `WireEnvelope` for decoding what the relay published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use event_bus::EventBus;
use futures::StreamExt;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::envelope::WireEnvelope;
use crate::process::manager::{ProcessManager, StepOutcome};

/// What a reply envelope resolved to, handed to `sync_wait` subscribers.
#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub succeeded: bool,
    pub payload: serde_json::Value,
}

type Waiters = Mutex<HashMap<Uuid, Vec<oneshot::Sender<ReplyOutcome>>>>;

/// Registers `sync_wait` subscribers and fans out replies consumed off the
/// reply queue to both the subscriber table and the Process Manager.
#[derive(Clone)]
pub struct ReplyDispatcher {
    waiters: Arc<Waiters>,
}

impl Default for ReplyDispatcher {
    fn default() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl ReplyDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `command_id`'s reply before the caller hands
    /// control back to the fast path, so no reply delivered between
    /// registration and `await` is missed (spec §9's subscribe-not-poll
    /// resolution of the `sync_wait` Open Question).
    pub fn subscribe(&self, command_id: Uuid) -> oneshot::Receiver<ReplyOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .entry(command_id)
            .or_default()
            .push(tx);
        rx
    }

    fn dispatch(&self, command_id: Uuid, outcome: ReplyOutcome) {
        if let Some(senders) = self.waiters.lock().unwrap().remove(&command_id) {
            for sender in senders {
                let _ = sender.send(outcome.clone());
            }
        }
    }

    /// Subscribes to the reply queue and routes each envelope: to the
    /// Process Manager when `processId` is present (sequential/parallel
    /// step replies, spec §4.5), and always to any registered `sync_wait`
    /// subscriber for that command id.
    pub fn spawn_consumer(
        self,
        bus: Arc<dyn EventBus>,
        topic: String,
        process_manager: ProcessManager,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(topic = %topic, "Starting reply consumer");

            let mut stream = match bus.subscribe(&topic).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "Failed to subscribe to reply queue");
                    return;
                }
            };

            while let Some(msg) = stream.next().await {
                let envelope = match WireEnvelope::decode(&msg.payload) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::error!(topic = %topic, error = %e, "Malformed reply envelope, dropping");
                        continue;
                    }
                };

                let Some(command_id) = envelope
                    .header("commandId")
                    .and_then(|s| Uuid::parse_str(s).ok())
                else {
                    tracing::warn!(topic = %topic, "Reply envelope missing commandId, dropping");
                    continue;
                };

                let succeeded = envelope.type_ != "CommandFailed";

                if envelope.header("processId").is_some() {
                    let step_outcome = if succeeded {
                        StepOutcome::Succeeded
                    } else {
                        StepOutcome::Failed
                    };
                    if let Err(e) = process_manager
                        .on_reply(command_id, step_outcome, envelope.payload.clone())
                        .await
                    {
                        tracing::error!(command_id = %command_id, error = %e, "Process manager failed to advance on reply");
                    }
                }

                self.dispatch(
                    command_id,
                    ReplyOutcome {
                        succeeded,
                        payload: envelope.payload.clone(),
                    },
                );
            }

            tracing::warn!(topic = %topic, "Reply consumer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_dispatch_delivers_outcome() {
        let dispatcher = ReplyDispatcher::new();
        let command_id = Uuid::new_v4();
        let rx = dispatcher.subscribe(command_id);

        dispatcher.dispatch(
            command_id,
            ReplyOutcome {
                succeeded: true,
                payload: serde_json::json!({"ok": true}),
            },
        );

        let outcome = rx.await.expect("sender dropped without sending");
        assert!(outcome.succeeded);
    }

    #[tokio::test]
    async fn dispatch_with_no_subscribers_is_a_no_op() {
        let dispatcher = ReplyDispatcher::new();
        dispatcher.dispatch(
            Uuid::new_v4(),
            ReplyOutcome {
                succeeded: false,
                payload: serde_json::Value::Null,
            },
        );
    }
}
