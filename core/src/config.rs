//! Runtime configuration loaded from the environment.
//!
//! Follows the same env-var-with-defaults shape every module's `main.rs`
//! uses (`dotenvy::dotenv().ok()` then `std::env::var(..).unwrap_or_else`)
//! rather than introducing a dedicated config-validation dependency.

use std::time::Duration;

/// Queue and topic naming policy (spec §6).
#[derive(Debug, Clone)]
pub struct QueueNaming {
    pub command_prefix: String,
    pub queue_suffix: String,
    pub reply_queue: String,
}

impl Default for QueueNaming {
    fn default() -> Self {
        Self {
            command_prefix: "APP.CMD.".to_string(),
            queue_suffix: ".Q".to_string(),
            reply_queue: "APP.CMD.REPLY.Q".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicNaming {
    pub event_prefix: String,
}

impl Default for TopicNaming {
    fn default() -> Self {
        Self {
            event_prefix: "events.".to_string(),
        }
    }
}

/// Platform-wide settings, all optional with the defaults named in spec §6.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: String,
    pub nats_url: String,
    pub host: String,
    pub port: u16,

    pub command_lease: Duration,
    pub max_backoff: Duration,
    pub sync_wait: Duration,
    pub outbox_sweep_interval: Duration,
    pub outbox_batch_size: i64,
    pub outbox_claim_timeout: Duration,
    pub max_transient_retries: i32,

    pub queue_naming: QueueNaming,
    pub topic_naming: TopicNaming,
}

impl Config {
    /// Load configuration from the environment, applying spec defaults for
    /// anything unset. Panics (fatal startup error, per spec §7) only on the
    /// mandatory `DATABASE_URL`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            bus_type: std::env::var("BUS_TYPE").unwrap_or_else(|_| "inmemory".to_string()),
            nats_url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8090".to_string())
                .parse()
                .expect("PORT must be a valid u16"),

            command_lease: env_duration_secs("COMMAND_LEASE_SECS", 5 * 60),
            max_backoff: env_duration_secs("MAX_BACKOFF_SECS", 5 * 60),
            sync_wait: env_duration_secs("SYNC_WAIT_SECS", 0),
            outbox_sweep_interval: env_duration_secs("OUTBOX_SWEEP_INTERVAL_SECS", 1),
            outbox_batch_size: std::env::var("OUTBOX_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
            outbox_claim_timeout: env_duration_secs("OUTBOX_CLAIM_TIMEOUT_SECS", 1),
            max_transient_retries: std::env::var("MAX_TRANSIENT_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),

            queue_naming: QueueNaming {
                command_prefix: std::env::var("QUEUE_COMMAND_PREFIX")
                    .unwrap_or_else(|_| QueueNaming::default().command_prefix),
                queue_suffix: std::env::var("QUEUE_SUFFIX")
                    .unwrap_or_else(|_| QueueNaming::default().queue_suffix),
                reply_queue: std::env::var("REPLY_QUEUE")
                    .unwrap_or_else(|_| QueueNaming::default().reply_queue),
            },
            topic_naming: TopicNaming {
                event_prefix: std::env::var("TOPIC_EVENT_PREFIX")
                    .unwrap_or_else(|_| TopicNaming::default().event_prefix),
            },
        }
    }
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_naming_matches_spec() {
        let naming = QueueNaming::default();
        assert_eq!(naming.command_prefix, "APP.CMD.");
        assert_eq!(naming.queue_suffix, ".Q");
        assert_eq!(naming.reply_queue, "APP.CMD.REPLY.Q");
    }

    #[test]
    fn default_topic_naming_matches_spec() {
        assert_eq!(TopicNaming::default().event_prefix, "events.");
    }
}
