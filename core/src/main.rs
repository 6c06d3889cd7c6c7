//! Process entrypoint: wires configuration, the database pool, the event
//! bus, the relay, the worker runtime, the reply dispatcher, and the HTTP
//! intake edge together, then serves.
//!
//! Grounded on `modules/payments::main`'s startup sequence (dotenv, tracing,
//! connect, migrate, pick a bus, spawn background tasks, serve), extended
//! with the worker pool, reply dispatcher, and metrics this platform adds.

use std::net::SocketAddr;
use std::sync::Arc;

use event_bus::{EventBus, InMemoryBus, NatsBus};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use commandbus::command::CommandStore;
use commandbus::command_bus::CommandBus;
use commandbus::config::Config;
use commandbus::dlq::DlqStore;
use commandbus::handler::HandlerRegistry;
use commandbus::http::{self, ApiState};
use commandbus::inbox::InboxStore;
use commandbus::metrics::{RelayMetrics, WorkerMetrics};
use commandbus::notifier::FastPathNotifier;
use commandbus::outbox::OutboxStore;
use commandbus::process::{ProcessManager, ProcessRegistry, ProcessStore};
use commandbus::relay::{self, RelayWorkerId};
use commandbus::reply_dispatcher::ReplyDispatcher;
use commandbus::worker::WorkerRuntime;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let bus: Arc<dyn EventBus> = match config.bus_type.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        "nats" => {
            tracing::info!(nats_url = %config.nats_url, "Connecting to NATS");
            let client = async_nats::connect(&config.nats_url)
                .await
                .expect("Failed to connect to NATS");
            Arc::new(NatsBus::new(client))
        }
        other => panic!("Invalid BUS_TYPE: {other}. Must be 'inmemory' or 'nats'"),
    };

    let commands = CommandStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let inbox = InboxStore::new(pool.clone());
    let dlq = DlqStore::new(pool.clone());
    let process_store = ProcessStore::new(pool.clone());

    let (notifier, fast_path_receiver) = FastPathNotifier::channel();
    let command_bus = CommandBus::new(commands.clone(), outbox.clone(), notifier.clone(), &config);

    // Command handlers and process configurations are registration points a
    // deployment of this runtime fills in; the runtime itself ships none.
    let handlers = Arc::new(HandlerRegistry::builder().build());
    let processes = Arc::new(ProcessRegistry::builder().build());
    let process_manager = ProcessManager::new(
        process_store,
        command_bus.clone(),
        processes,
        config.queue_naming.reply_queue.clone(),
    );

    let relay_metrics = Arc::new(RelayMetrics::default());
    let worker_metrics = Arc::new(WorkerMetrics::default());

    let relay_worker_id = RelayWorkerId::default();
    relay::spawn_sweep_loop(
        outbox.clone(),
        bus.clone(),
        config.clone(),
        relay_worker_id.clone(),
        relay_metrics.clone(),
    );
    relay::spawn_fast_path(
        outbox.clone(),
        bus.clone(),
        config.clone(),
        relay_worker_id,
        fast_path_receiver,
        relay_metrics.clone(),
    );

    let worker_runtime = WorkerRuntime {
        pool: pool.clone(),
        commands,
        outbox,
        inbox,
        dlq,
        handlers,
        notifier,
        config: config.clone(),
        metrics: worker_metrics.clone(),
    };
    worker_runtime.spawn_all(bus.clone());

    let reply_dispatcher = ReplyDispatcher::new();
    reply_dispatcher
        .clone()
        .spawn_consumer(bus.clone(), http::reply_queue_topic(&config), process_manager);

    let state = ApiState {
        command_bus,
        reply_dispatcher,
        sync_wait: config.sync_wait,
        relay_metrics,
        worker_metrics,
    };

    let app = http::router(state);

    let addr = SocketAddr::from((
        config
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or_else(|_| [0, 0, 0, 0].into()),
        config.port,
    ));
    tracing::info!(%addr, "Command bus listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
