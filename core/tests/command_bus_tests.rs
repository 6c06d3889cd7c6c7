mod common;

use commandbus::command::{CommandStore, ReplyRouting};
use commandbus::command_bus::CommandBus;
use commandbus::notifier::FastPathNotifier;
use commandbus::outbox::OutboxStore;
use serial_test::serial;
use uuid::Uuid;

#[tokio::test]
#[serial]
async fn accept_inserts_command_and_one_outbox_row_atomically() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let (notifier, mut receiver) = FastPathNotifier::channel();
    let config = common::test_config();
    let bus = CommandBus::new(commands.clone(), outbox.clone(), notifier, &config);

    let key = format!("test:{}", Uuid::new_v4());
    let command_id = bus
        .accept(
            "CreateUser",
            &key,
            "biz-accept",
            &serde_json::json!({"email": "ada@example.com"}),
            ReplyRouting::default(),
        )
        .await
        .expect("accept should succeed");

    let command = commands.find(command_id).await.unwrap().expect("command row should exist");
    assert_eq!(command.idempotency_key, key);

    let outbox_id = receiver.recv().await.expect("fast path should be notified");
    let row = sqlx::query_as::<_, (String, String)>("SELECT topic, type FROM outbox WHERE id = $1")
        .bind(outbox_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.0, "APP.CMD.CREATEUSER.Q");
    assert_eq!(row.1, "CommandRequested");

    sqlx::query("DELETE FROM outbox WHERE id = $1").bind(outbox_id).execute(&pool).await.ok();
    sqlx::query("DELETE FROM command WHERE id = $1").bind(command_id).execute(&pool).await.ok();
    common::teardown_pool(pool).await;
}

#[tokio::test]
#[serial]
async fn accept_rejects_a_replayed_idempotency_key() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let (notifier, _receiver) = FastPathNotifier::channel();
    let config = common::test_config();
    let bus = CommandBus::new(commands.clone(), outbox.clone(), notifier, &config);

    let key = format!("test:{}", Uuid::new_v4());
    let first = bus
        .accept("CreateUser", &key, "biz-dup", &serde_json::json!({}), ReplyRouting::default())
        .await
        .unwrap();

    let second = bus
        .accept("CreateUser", &key, "biz-dup", &serde_json::json!({}), ReplyRouting::default())
        .await;

    assert!(matches!(
        second,
        Err(commandbus::error::CommandBusError::DuplicateIdempotencyKey)
    ));

    sqlx::query("DELETE FROM command WHERE id = $1").bind(first).execute(&pool).await.ok();
    sqlx::query("DELETE FROM outbox WHERE key = $1").bind("biz-dup").execute(&pool).await.ok();
    common::teardown_pool(pool).await;
}
