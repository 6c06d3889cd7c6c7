//! Outbox Relay (C3, relay half, spec §4.2): the sweep loop and fast-path
//! task that drain the outbox into the event bus.
//!
//! Grounded on `ar-rs`/`subscriptions`'s "poll unpublished, publish, mark
//! published" task shape (a `tokio::spawn`ed `loop { interval.tick().await
//! ... }`), generalized to the claim-lease sweep plus a second fast-path
//! task racing the sweep for freshly-committed rows, per spec §4.2.

use std::sync::Arc;

use event_bus::EventBus;

use crate::config::Config;
use crate::envelope::WireEnvelope;
use crate::metrics::RelayMetrics;
use crate::notifier::FastPathReceiver;
use crate::outbox::{OutboxMessage, OutboxStore};

/// Identifies this relay process/task for the purposes of outbox claims.
/// Distinct worker ids let multiple relay instances run without stepping on
/// each other's claims (spec §5: `SELECT ... FOR UPDATE SKIP LOCKED`).
#[derive(Clone)]
pub struct RelayWorkerId(pub String);

impl Default for RelayWorkerId {
    fn default() -> Self {
        Self(format!("relay-{}", uuid::Uuid::new_v4()))
    }
}

/// Publishes one claimed outbox row to the broker. `category` selects the
/// target: command/reply rows go to the MQ-style queue named in `topic`,
/// event rows go to the event-stream topic named in `topic` — both are
/// simply subjects on the same `EventBus` abstraction (spec §4.2 step 2).
async fn publish_one(bus: &dyn EventBus, message: &OutboxMessage) -> Result<(), event_bus::BusError> {
    let envelope = WireEnvelope::new(&message.type_, &message.headers_map(), &message.payload);
    let body = envelope
        .encode()
        .map_err(|e| event_bus::BusError::SerializationError(e.to_string()))?;
    bus.publish(&message.topic, body).await
}

async fn dispatch_claimed(
    bus: &dyn EventBus,
    outbox: &OutboxStore,
    max_backoff: chrono::Duration,
    message: OutboxMessage,
    metrics: &RelayMetrics,
) {
    let id = message.id;
    match publish_one(bus, &message).await {
        Ok(()) => {
            if let Err(e) = outbox.mark_published(id).await {
                tracing::error!(outbox_id = id, error = %e, "Failed to mark outbox row published");
            } else {
                metrics.record_published();
                tracing::debug!(outbox_id = id, topic = %message.topic, "Outbox row published");
            }
        }
        Err(e) => {
            metrics.record_publish_failure();
            tracing::warn!(outbox_id = id, topic = %message.topic, error = %e, "Outbox publish failed, will retry");
            if let Err(db_err) = outbox
                .mark_publish_failed(id, &e.to_string(), max_backoff)
                .await
            {
                tracing::error!(outbox_id = id, error = %db_err, "Failed to record outbox publish failure");
            }
        }
    }
}

/// spec §4.2 sweep loop: on every tick, claim a batch of due/stuck rows and
/// dispatch each to the bus.
pub fn spawn_sweep_loop(
    outbox: OutboxStore,
    bus: Arc<dyn EventBus>,
    config: Config,
    worker_id: RelayWorkerId,
    metrics: Arc<RelayMetrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.outbox_sweep_interval);
        let claim_timeout = chrono::Duration::from_std(config.outbox_claim_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let max_backoff = chrono::Duration::from_std(config.max_backoff)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        loop {
            interval.tick().await;

            let claimed = match outbox
                .claim_batch(&worker_id.0, config.outbox_batch_size, claim_timeout)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::error!(error = %e, "Outbox sweep claim failed");
                    continue;
                }
            };

            if claimed.is_empty() {
                continue;
            }

            metrics.record_claims(claimed.len());
            tracing::debug!(count = claimed.len(), "Outbox sweep claimed rows");
            for message in claimed {
                dispatch_claimed(bus.as_ref(), &outbox, max_backoff, message, &metrics).await;
            }
        }
    })
}

/// spec §4.2 fast path: drain notifications of freshly-committed outbox
/// rows and attempt to claim+publish each immediately. Losing the claim
/// race to the sweep loop is expected and harmless.
pub fn spawn_fast_path(
    outbox: OutboxStore,
    bus: Arc<dyn EventBus>,
    config: Config,
    worker_id: RelayWorkerId,
    mut receiver: FastPathReceiver,
    metrics: Arc<RelayMetrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let claim_timeout = chrono::Duration::from_std(config.outbox_claim_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let max_backoff = chrono::Duration::from_std(config.max_backoff)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        while let Some(outbox_id) = receiver.recv().await {
            match outbox.claim_by_id(&worker_id.0, outbox_id, claim_timeout).await {
                Ok(Some(message)) => {
                    metrics.record_claims(1);
                    dispatch_claimed(bus.as_ref(), &outbox, max_backoff, message, &metrics).await;
                }
                Ok(None) => {
                    // Another worker already has it, or it was already
                    // published — the sweep loop is the safety net.
                }
                Err(e) => {
                    tracing::warn!(outbox_id, error = %e, "Fast-path claim failed");
                }
            }
        }

        tracing::warn!("Outbox fast-path task stopped: notifier channel closed");
    })
}
