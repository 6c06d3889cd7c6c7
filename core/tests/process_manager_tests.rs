mod common;

use std::collections::HashMap;
use std::sync::Arc;

use commandbus::command::CommandStore;
use commandbus::command_bus::CommandBus;
use commandbus::notifier::FastPathNotifier;
use commandbus::outbox::OutboxStore;
use commandbus::process::{
    NextStepStrategy, ProcessConfiguration, ProcessManager, ProcessRegistry, ProcessStatus,
    ProcessStep, ProcessStore, StepOutcome,
};
use serial_test::serial;

fn two_step_config() -> ProcessConfiguration {
    let mut steps = HashMap::new();
    steps.insert(
        "charge".to_string(),
        ProcessStep {
            name: "charge".to_string(),
            command_type: "ChargeCard".to_string(),
            compensation_command_type: Some("RefundCard".to_string()),
            next_step_strategy: NextStepStrategy::Direct { next_step: "ship".to_string() },
        },
    );
    steps.insert(
        "ship".to_string(),
        ProcessStep {
            name: "ship".to_string(),
            command_type: "ShipOrder".to_string(),
            compensation_command_type: None,
            next_step_strategy: NextStepStrategy::Terminal,
        },
    );

    ProcessConfiguration {
        process_type: "OrderFulfillment".to_string(),
        start_step: "charge".to_string(),
        steps,
    }
}

#[tokio::test]
#[serial]
async fn start_schedules_the_start_step_and_on_reply_advances_to_completion() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let process_store = ProcessStore::new(pool.clone());
    let (notifier, _receiver) = FastPathNotifier::channel();
    let config = common::test_config();
    let command_bus = CommandBus::new(commands.clone(), outbox.clone(), notifier, &config);

    let registry = Arc::new(
        ProcessRegistry::builder()
            .register(two_step_config())
            .unwrap()
            .build(),
    );
    let manager = ProcessManager::new(
        process_store.clone(),
        command_bus,
        registry,
        config.queue_naming.reply_queue.clone(),
    );

    let process_id = manager
        .start("OrderFulfillment", "order-1", serde_json::json!({"order_id": "order-1"}))
        .await
        .expect("start should succeed");

    let instance = process_store.find(process_id).await.unwrap().expect("instance should be persisted");
    assert_eq!(instance.status(), ProcessStatus::Running);
    assert_eq!(instance.current_step, "charge");
    let command_id = instance.current_command_id.expect("start step command id should be tracked");

    // `onReply` must be able to find this instance by the scheduled command id.
    let found = process_store.find_by_command(command_id).await.unwrap();
    assert_eq!(found.map(|i| i.id), Some(process_id));

    manager
        .on_reply(command_id, StepOutcome::Succeeded, serde_json::json!({"charged": true}))
        .await
        .expect("advance to ship should succeed");

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    assert_eq!(instance.current_step, "ship");
    assert_eq!(instance.status(), ProcessStatus::Running);
    let ship_command_id = instance.current_command_id.expect("ship step command id should be tracked");

    manager
        .on_reply(ship_command_id, StepOutcome::Succeeded, serde_json::json!({"shipped": true}))
        .await
        .expect("advance to terminal should succeed");

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    assert_eq!(instance.status(), ProcessStatus::Completed);

    sqlx::query("DELETE FROM process_instance WHERE id = $1").bind(process_id).execute(&pool).await.ok();
    sqlx::query("DELETE FROM command WHERE business_key = $1").bind("order-1").execute(&pool).await.ok();
    sqlx::query("DELETE FROM outbox WHERE key = $1").bind("order-1").execute(&pool).await.ok();
    common::teardown_pool(pool).await;
}

fn parallel_config() -> ProcessConfiguration {
    let mut steps = HashMap::new();
    steps.insert(
        "begin".to_string(),
        ProcessStep {
            name: "begin".to_string(),
            command_type: "BeginFulfillment".to_string(),
            compensation_command_type: None,
            next_step_strategy: NextStepStrategy::Parallel {
                branches: vec!["charge".to_string(), "reserve_stock".to_string()],
                join_step: "notify".to_string(),
            },
        },
    );
    steps.insert(
        "charge".to_string(),
        ProcessStep {
            name: "charge".to_string(),
            command_type: "ChargeCard".to_string(),
            compensation_command_type: Some("RefundCard".to_string()),
            next_step_strategy: NextStepStrategy::Terminal,
        },
    );
    steps.insert(
        "reserve_stock".to_string(),
        ProcessStep {
            name: "reserve_stock".to_string(),
            command_type: "ReserveStock".to_string(),
            compensation_command_type: Some("ReleaseStock".to_string()),
            next_step_strategy: NextStepStrategy::Terminal,
        },
    );
    steps.insert(
        "notify".to_string(),
        ProcessStep {
            name: "notify".to_string(),
            command_type: "NotifyCustomer".to_string(),
            compensation_command_type: None,
            next_step_strategy: NextStepStrategy::Terminal,
        },
    );

    ProcessConfiguration {
        process_type: "ParallelFulfillment".to_string(),
        start_step: "begin".to_string(),
        steps,
    }
}

#[tokio::test]
#[serial]
async fn parallel_branches_all_succeeding_schedule_the_join_step() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let process_store = ProcessStore::new(pool.clone());
    let (notifier, _receiver) = FastPathNotifier::channel();
    let config = common::test_config();
    let command_bus = CommandBus::new(commands.clone(), outbox.clone(), notifier, &config);

    let registry = Arc::new(
        ProcessRegistry::builder()
            .register(parallel_config())
            .unwrap()
            .build(),
    );
    let manager = ProcessManager::new(
        process_store.clone(),
        command_bus,
        registry,
        config.queue_naming.reply_queue.clone(),
    );

    let process_id = manager
        .start("ParallelFulfillment", "order-3", serde_json::json!({}))
        .await
        .unwrap();

    // `start` only schedules the root "begin" command; the parallel fan-out
    // happens once that step's reply arrives and `advance` consults its
    // Parallel next_step_strategy.
    let instance = process_store.find(process_id).await.unwrap().unwrap();
    assert_eq!(instance.current_step, "begin");
    let begin_command_id = instance.current_command_id.expect("begin step command id should be tracked");

    manager
        .on_reply(begin_command_id, StepOutcome::Succeeded, serde_json::json!({}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    assert_eq!(instance.status(), ProcessStatus::Waiting);
    let pending = instance.pending_parallel().expect("pending_parallel must be set during a parallel region");
    assert_eq!(pending.expected.len(), 2);
    assert_eq!(pending.branch_commands.len(), 2);

    let charge_id = *pending.branch_commands.get("charge").unwrap();
    let reserve_id = *pending.branch_commands.get("reserve_stock").unwrap();

    // `onReply` must resolve a branch command id back to this instance via
    // `pending_parallel.branch_commands`, not just `current_command_id`.
    let found = process_store.find_by_command(charge_id).await.unwrap();
    assert_eq!(found.map(|i| i.id), Some(process_id));

    manager
        .on_reply(charge_id, StepOutcome::Succeeded, serde_json::json!({"charged": true}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    assert_eq!(instance.status(), ProcessStatus::Waiting, "region not resolved until both branches report");

    manager
        .on_reply(reserve_id, StepOutcome::Succeeded, serde_json::json!({"reserved": true}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    assert_eq!(instance.current_step, "notify");
    assert_eq!(instance.status(), ProcessStatus::Running, "join step scheduled once both branches succeed");

    sqlx::query("DELETE FROM process_instance WHERE id = $1").bind(process_id).execute(&pool).await.ok();
    sqlx::query("DELETE FROM command WHERE business_key = $1").bind("order-3").execute(&pool).await.ok();
    sqlx::query("DELETE FROM outbox WHERE key = $1").bind("order-3").execute(&pool).await.ok();
    common::teardown_pool(pool).await;
}

#[tokio::test]
#[serial]
async fn parallel_branch_failure_compensates_completed_siblings_in_reverse_order() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let process_store = ProcessStore::new(pool.clone());
    let (notifier, _receiver) = FastPathNotifier::channel();
    let config = common::test_config();
    let command_bus = CommandBus::new(commands.clone(), outbox.clone(), notifier, &config);

    let registry = Arc::new(
        ProcessRegistry::builder()
            .register(parallel_config())
            .unwrap()
            .build(),
    );
    let manager = ProcessManager::new(
        process_store.clone(),
        command_bus,
        registry,
        config.queue_naming.reply_queue.clone(),
    );

    let process_id = manager
        .start("ParallelFulfillment", "order-4", serde_json::json!({}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    let begin_command_id = instance.current_command_id.expect("begin step command id should be tracked");
    manager
        .on_reply(begin_command_id, StepOutcome::Succeeded, serde_json::json!({}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    let pending = instance.pending_parallel().unwrap();
    let charge_id = *pending.branch_commands.get("charge").unwrap();
    let reserve_id = *pending.branch_commands.get("reserve_stock").unwrap();

    // charge succeeds, reserve_stock fails: only charge was completed, so
    // only charge's compensation (RefundCard) should be scheduled.
    manager
        .on_reply(charge_id, StepOutcome::Succeeded, serde_json::json!({"charged": true}))
        .await
        .unwrap();
    manager
        .on_reply(reserve_id, StepOutcome::Failed, serde_json::json!({"error": "out of stock"}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    assert_eq!(instance.status(), ProcessStatus::Compensating);

    sqlx::query("DELETE FROM process_instance WHERE id = $1").bind(process_id).execute(&pool).await.ok();
    sqlx::query("DELETE FROM command WHERE business_key = $1").bind("order-4").execute(&pool).await.ok();
    sqlx::query("DELETE FROM outbox WHERE key = $1").bind("order-4").execute(&pool).await.ok();
    common::teardown_pool(pool).await;
}

#[tokio::test]
#[serial]
async fn a_failed_step_triggers_reverse_order_compensation() {
    let pool = common::setup_pool().await;
    let commands = CommandStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let process_store = ProcessStore::new(pool.clone());
    let (notifier, _receiver) = FastPathNotifier::channel();
    let config = common::test_config();
    let command_bus = CommandBus::new(commands.clone(), outbox.clone(), notifier, &config);

    let registry = Arc::new(
        ProcessRegistry::builder()
            .register(two_step_config())
            .unwrap()
            .build(),
    );
    let manager = ProcessManager::new(
        process_store.clone(),
        command_bus,
        registry,
        config.queue_naming.reply_queue.clone(),
    );

    let process_id = manager
        .start("OrderFulfillment", "order-2", serde_json::json!({"order_id": "order-2"}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    let charge_command_id = instance.current_command_id.unwrap();

    manager
        .on_reply(charge_command_id, StepOutcome::Succeeded, serde_json::json!({}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    let ship_command_id = instance.current_command_id.unwrap();

    manager
        .on_reply(ship_command_id, StepOutcome::Failed, serde_json::json!({"error": "carrier down"}))
        .await
        .unwrap();

    let instance = process_store.find(process_id).await.unwrap().unwrap();
    assert_eq!(instance.status(), ProcessStatus::Compensating);

    sqlx::query("DELETE FROM process_instance WHERE id = $1").bind(process_id).execute(&pool).await.ok();
    sqlx::query("DELETE FROM command WHERE business_key = $1").bind("order-2").execute(&pool).await.ok();
    sqlx::query("DELETE FROM outbox WHERE key = $1").bind("order-2").execute(&pool).await.ok();
    common::teardown_pool(pool).await;
}
