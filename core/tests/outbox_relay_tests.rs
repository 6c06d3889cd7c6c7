mod common;

use commandbus::outbox::{NewOutboxMessage, OutboxCategory, OutboxStore};
use serial_test::serial;
use std::collections::HashMap;

#[tokio::test]
#[serial]
async fn enqueue_then_claim_batch_marks_published() {
    let pool = common::setup_pool().await;
    let outbox = OutboxStore::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    let mut headers = HashMap::new();
    headers.insert("commandId".to_string(), "abc-123".to_string());
    let id = outbox
        .enqueue(
            &mut tx,
            NewOutboxMessage {
                category: OutboxCategory::Command,
                topic: "APP.CMD.CREATEUSER.Q".to_string(),
                key: "biz-1".to_string(),
                type_: "CommandRequested".to_string(),
                payload: serde_json::json!({"name": "Ada"}),
                headers,
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let claimed = outbox
        .claim_batch("relay-test", 10, chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert!(claimed.iter().any(|m| m.id == id));

    // A second claimer should not see the row while the lease holds.
    let second = outbox
        .claim_batch("relay-test-2", 10, chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert!(!second.iter().any(|m| m.id == id));

    outbox.mark_published(id).await.unwrap();

    let after = outbox
        .claim_batch("relay-test-3", 10, chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert!(!after.iter().any(|m| m.id == id), "published rows must never be reclaimed");

    sqlx::query("DELETE FROM outbox WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .ok();
    common::teardown_pool(pool).await;
}

#[tokio::test]
#[serial]
async fn publish_failure_schedules_a_backoff_and_releases_the_claim() {
    let pool = common::setup_pool().await;
    let outbox = OutboxStore::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    let id = outbox
        .enqueue(
            &mut tx,
            NewOutboxMessage {
                category: OutboxCategory::Event,
                topic: "events.CreateUser".to_string(),
                key: "biz-2".to_string(),
                type_: "UserCreated".to_string(),
                payload: serde_json::json!({}),
                headers: HashMap::new(),
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    outbox
        .claim_batch("relay-test", 10, chrono::Duration::seconds(5))
        .await
        .unwrap();

    outbox
        .mark_publish_failed(id, "broker unreachable", chrono::Duration::seconds(60))
        .await
        .unwrap();

    let row = sqlx::query_as::<_, (String, i32)>("SELECT status, attempts FROM outbox WHERE id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.0, "NEW");
    assert_eq!(row.1, 1);

    sqlx::query("DELETE FROM outbox WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .ok();
    common::teardown_pool(pool).await;
}
