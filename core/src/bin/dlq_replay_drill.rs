//! Operational drill: replay one or more parked DLQ entries as brand-new
//! PENDING commands (SPEC_FULL §10.6 "DLQ replay"). Run with no arguments to
//! list recent parked entries; pass one or more DLQ entry ids to requeue
//! them via `DlqStore::requeue`.
//!
//! Grounded on `modules/payments::main`'s connect-then-act startup shape,
//! trimmed to a one-shot CLI instead of a long-lived server.

use commandbus::command::CommandStore;
use commandbus::command_bus::CommandBus;
use commandbus::config::Config;
use commandbus::dlq::DlqStore;
use commandbus::notifier::FastPathNotifier;
use commandbus::outbox::OutboxStore;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let commands = CommandStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let (notifier, _fast_path_receiver) = FastPathNotifier::channel();
    let command_bus = CommandBus::new(commands, outbox, notifier, &config);
    let dlq = DlqStore::new(pool);

    let entry_ids: Vec<Uuid> = std::env::args()
        .skip(1)
        .map(|arg| Uuid::parse_str(&arg).unwrap_or_else(|_| panic!("invalid DLQ entry id: {arg}")))
        .collect();

    if entry_ids.is_empty() {
        let recent = dlq
            .list_recent(50)
            .await
            .expect("Failed to list DLQ entries");

        if recent.is_empty() {
            println!("No parked DLQ entries.");
            return;
        }

        println!("Recent parked DLQ entries (pass one or more ids to requeue):");
        for entry in recent {
            println!(
                "  {}  command={} name={} error_class={} attempts={}",
                entry.id, entry.command_id, entry.command_name, entry.error_class, entry.attempts
            );
        }
        return;
    }

    for entry_id in entry_ids {
        match dlq.requeue(&command_bus, entry_id).await {
            Ok(new_command_id) => {
                println!("Requeued DLQ entry {entry_id} as command {new_command_id}");
            }
            Err(e) => {
                eprintln!("Failed to requeue DLQ entry {entry_id}: {e}");
            }
        }
    }
}
