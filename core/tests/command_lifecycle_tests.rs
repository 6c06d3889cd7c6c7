mod common;

use commandbus::command::{CommandStatus, CommandStore, ReplyRouting};
use serial_test::serial;
use uuid::Uuid;

#[tokio::test]
#[serial]
async fn duplicate_idempotency_key_is_rejected() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let key = format!("test:{}", Uuid::new_v4());

    let mut tx = pool.begin().await.unwrap();
    commands
        .insert_pending(&mut tx, "CreateUser", "biz-1", &serde_json::json!({}), &key, &ReplyRouting::default())
        .await
        .expect("first insert should succeed");
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let result = commands
        .insert_pending(&mut tx, "CreateUser", "biz-1", &serde_json::json!({}), &key, &ReplyRouting::default())
        .await;

    assert!(matches!(
        result,
        Err(commandbus::error::CommandBusError::DuplicateIdempotencyKey)
    ));

    sqlx::query("DELETE FROM command WHERE idempotency_key = $1")
        .bind(&key)
        .execute(&pool)
        .await
        .ok();
    common::teardown_pool(pool).await;
}

#[tokio::test]
#[serial]
async fn lease_then_succeed_transitions_through_running() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let key = format!("test:{}", Uuid::new_v4());

    let mut tx = pool.begin().await.unwrap();
    let id = commands
        .insert_pending(&mut tx, "CreateUser", "biz-2", &serde_json::json!({"a": 1}), &key, &ReplyRouting::default())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let leased = commands
        .try_lease(&mut tx, id, chrono::Duration::seconds(60))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(leased.is_some());
    assert_eq!(leased.unwrap().status(), CommandStatus::Running);

    // A second lease attempt before the first lease expires must fail.
    let mut tx = pool.begin().await.unwrap();
    let relocked = commands
        .try_lease(&mut tx, id, chrono::Duration::seconds(60))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(relocked.is_none(), "an unexpired lease must not be retaken");

    let mut tx = pool.begin().await.unwrap();
    commands
        .mark_succeeded(&mut tx, id, &serde_json::json!({"ok": true}))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let command = commands.find(id).await.unwrap().expect("command should exist");
    assert_eq!(command.status(), CommandStatus::Succeeded);
    assert_eq!(command.reply, Some(serde_json::json!({"ok": true})));

    sqlx::query("DELETE FROM command WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .ok();
    common::teardown_pool(pool).await;
}

#[tokio::test]
#[serial]
async fn transient_retry_increments_retries_then_reclaim_sweep_finds_expired_leases() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let key = format!("test:{}", Uuid::new_v4());

    let mut tx = pool.begin().await.unwrap();
    let id = commands
        .insert_pending(&mut tx, "ChargeCard", "biz-3", &serde_json::json!({}), &key, &ReplyRouting::default())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let retries = commands.retry_pending(&mut tx, id, "timeout talking to processor").await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(retries, 1);

    // Lease it, then force the lease into the past to simulate a dead worker.
    let mut tx = pool.begin().await.unwrap();
    commands.try_lease(&mut tx, id, chrono::Duration::seconds(60)).await.unwrap();
    tx.commit().await.unwrap();

    sqlx::query("UPDATE command SET processing_lease_until = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    let reclaimed = commands.reclaim_expired_leases().await.unwrap();
    assert!(reclaimed.iter().any(|c| c.id == id));
    let reclaimed_row = reclaimed.into_iter().find(|c| c.id == id).unwrap();
    assert_eq!(reclaimed_row.status(), CommandStatus::Pending);
    assert_eq!(reclaimed_row.retries, 2);

    sqlx::query("DELETE FROM command WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .ok();
    common::teardown_pool(pool).await;
}
