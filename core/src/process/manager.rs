//! Process Manager (C8, spec §4.5): starts process instances, advances them
//! on reply/event, and drives compensation.
//!
//! Grounded on `CommandBus::accept` for "schedule a step" (idempotency key
//! derivation + outbox enqueue in one transaction), generalized to the
//! process advance/compensation algorithm spec §4.5 describes — nothing in
//! the teacher repo implements a saga/process manager, so this module's
//! control flow is a direct translation of the spec's numbered steps rather
//! than an adaptation of an existing teacher file. State is persisted and
//! the next command scheduled inside the same transaction (via
//! `CommandBus::accept_in_tx`), per spec §4.5's determinism requirement.

use std::collections::HashMap;

use uuid::Uuid;

use crate::command::ReplyRouting;
use crate::command_bus::CommandBus;
use crate::error::ProcessError;

use super::config::{NextStepStrategy, ProcessConfiguration, ProcessRegistry, ProcessStep};
use super::instance::{HistoryEntry, PendingParallel, ProcessInstance, ProcessStatus};
use super::store::ProcessStore;

#[derive(Clone)]
pub struct ProcessManager {
    store: ProcessStore,
    command_bus: CommandBus,
    registry: std::sync::Arc<ProcessRegistry>,
    /// Where step replies are routed back to. Must match the topic the
    /// `ReplyDispatcher` actually subscribes to (spec §4.5 `onReply`) —
    /// routing to a queue nobody drains would leave every process instance
    /// permanently WAITING, so this is the configured reply queue
    /// (`config.queue_naming.reply_queue`), not a process-manager-private one.
    reply_queue: String,
}

/// The outcome of a single step, as reported by `on_reply`/`on_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

/// Snapshot of what `advance` decided to persist, before the transaction
/// that writes it and schedules any follow-on commands.
struct Transition<'a> {
    current_step: String,
    status: ProcessStatus,
    pending_parallel: Option<PendingParallel>,
    history: Vec<HistoryEntry>,
    completed_steps: Vec<String>,
    schedule: Vec<&'a ProcessStep>,
}

impl ProcessManager {
    pub fn new(
        store: ProcessStore,
        command_bus: CommandBus,
        registry: std::sync::Arc<ProcessRegistry>,
        reply_queue: String,
    ) -> Self {
        Self {
            store,
            command_bus,
            registry,
            reply_queue,
        }
    }

    /// spec §4.5 `start`: creates a RUNNING process at the start step and
    /// emits the start step's command via the Command Bus.
    pub async fn start(
        &self,
        process_type: &str,
        business_key: &str,
        initial_data: serde_json::Value,
    ) -> Result<Uuid, ProcessError> {
        let config = self
            .registry
            .get(process_type)
            .ok_or_else(|| ProcessError::UnknownProcessType(process_type.to_string()))?;

        let step = config
            .step(&config.start_step)
            .ok_or_else(|| ProcessError::UnknownStep(config.start_step.clone()))?;

        let mut tx = self.store.pool().begin().await?;
        let process_id = self
            .store
            .create(&mut tx, process_type, business_key, &config.start_step, &initial_data)
            .await?;

        let (command_id, outbox_id) = self
            .schedule_in_tx(&mut tx, process_id, business_key, &initial_data, step, 0)
            .await?;

        // `create` leaves `current_command_id` NULL; fill it in now that the
        // start step's command id is known, so `onReply` can find this
        // instance (spec §4.5 `onReply`).
        self.store
            .save(
                &mut tx,
                process_id,
                &config.start_step,
                ProcessStatus::Running,
                &initial_data,
                None,
                &[],
                &[],
                Some(command_id),
                0,
            )
            .await?;

        tx.commit().await?;
        self.command_bus.notify(outbox_id);

        tracing::info!(process_id = %process_id, process_type = %process_type, "Process started");

        Ok(process_id)
    }

    /// spec §4.5 `onReply`: merge the reply payload into `data` and advance.
    pub async fn on_reply(
        &self,
        command_id: Uuid,
        outcome: StepOutcome,
        reply_payload: serde_json::Value,
    ) -> Result<(), ProcessError> {
        let instance = self
            .store
            .find_by_command(command_id)
            .await?
            .ok_or(ProcessError::InstanceNotFound(command_id))?;

        let config = self
            .registry
            .get(&instance.process_type)
            .ok_or_else(|| ProcessError::UnknownProcessType(instance.process_type.clone()))?;

        self.advance(instance, config, command_id, outcome, reply_payload)
            .await
    }

    /// spec §4.5 `onEvent`: same as `onReply` when the transition is
    /// event-driven; reuses the same advance algorithm against the instance
    /// whose current step is waiting on this event.
    pub async fn on_event(
        &self,
        process_id: Uuid,
        outcome: StepOutcome,
        event_payload: serde_json::Value,
    ) -> Result<(), ProcessError> {
        let instance = self
            .store
            .find(process_id)
            .await?
            .ok_or(ProcessError::InstanceNotFound(process_id))?;

        let config = self
            .registry
            .get(&instance.process_type)
            .ok_or_else(|| ProcessError::UnknownProcessType(instance.process_type.clone()))?;

        let fabricated_command_id = Uuid::new_v4();
        self.advance(instance, config, fabricated_command_id, outcome, event_payload)
            .await
    }

    /// spec §4.5 "Advance algorithm".
    async fn advance(
        &self,
        mut instance: ProcessInstance,
        config: &ProcessConfiguration,
        command_id: Uuid,
        outcome: StepOutcome,
        reply_payload: serde_json::Value,
    ) -> Result<(), ProcessError> {
        merge_json(&mut instance.data, &reply_payload);

        if instance.status() == ProcessStatus::Compensating {
            return self.advance_compensation(instance, config).await;
        }

        if let Some(mut pending) = instance.pending_parallel() {
            return self
                .advance_parallel_branch(instance, config, &mut pending, command_id, outcome)
                .await;
        }

        let current_step_name = instance.current_step.clone();
        let step = config
            .step(&current_step_name)
            .ok_or_else(|| ProcessError::UnknownStep(current_step_name.clone()))?;

        if outcome == StepOutcome::Failed {
            return self.begin_compensation(instance, config).await;
        }

        let mut history = instance.history();
        history.push(HistoryEntry {
            step: current_step_name.clone(),
            command_id: Some(command_id),
            status: "SUCCEEDED".to_string(),
            at: chrono::Utc::now(),
        });
        let mut completed_steps = instance.completed_steps();
        completed_steps.push(current_step_name.clone());

        let transition = match &step.next_step_strategy {
            NextStepStrategy::Terminal => Transition {
                current_step: current_step_name,
                status: ProcessStatus::Completed,
                pending_parallel: None,
                history,
                completed_steps,
                schedule: Vec::new(),
            },
            NextStepStrategy::Direct { next_step } => {
                let next = config
                    .step(next_step)
                    .ok_or_else(|| ProcessError::UnknownStep(next_step.clone()))?;
                Transition {
                    current_step: next_step.clone(),
                    status: ProcessStatus::Running,
                    pending_parallel: None,
                    history,
                    completed_steps,
                    schedule: vec![next],
                }
            }
            NextStepStrategy::Conditional { branches, default_step } => {
                let chosen = branches
                    .iter()
                    .find(|(predicate_key, _)| {
                        instance
                            .data
                            .get(predicate_key)
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false)
                    })
                    .map(|(_, step)| step)
                    .unwrap_or(default_step);

                let next = config
                    .step(chosen)
                    .ok_or_else(|| ProcessError::UnknownStep(chosen.clone()))?;
                Transition {
                    current_step: chosen.clone(),
                    status: ProcessStatus::Running,
                    pending_parallel: None,
                    history,
                    completed_steps,
                    schedule: vec![next],
                }
            }
            NextStepStrategy::Parallel { branches, join_step } => {
                let mut branch_steps = Vec::new();
                for branch in branches {
                    branch_steps.push(
                        config
                            .step(branch)
                            .ok_or_else(|| ProcessError::UnknownStep(branch.clone()))?,
                    );
                }

                Transition {
                    current_step: join_step.clone(),
                    status: ProcessStatus::Waiting,
                    pending_parallel: Some(PendingParallel {
                        join_step: join_step.clone(),
                        expected: branches.clone(),
                        completed: Vec::new(),
                        failed: Vec::new(),
                        branch_commands: HashMap::new(),
                        completion_order: Vec::new(),
                    }),
                    history,
                    completed_steps,
                    schedule: branch_steps,
                }
            }
        };

        let is_parallel_fanout = matches!(step.next_step_strategy, NextStepStrategy::Parallel { .. });
        let command_ids = self.commit_transition(&instance, &transition).await?;

        if is_parallel_fanout {
            if let Some(mut pending) = transition.pending_parallel {
                for (branch, command_id) in transition
                    .schedule
                    .iter()
                    .map(|s| s.name.clone())
                    .zip(command_ids)
                {
                    pending.branch_commands.insert(branch, command_id);
                }
                // Branch command ids are only known after scheduling, so
                // persist them in a short follow-up write.
                self.persist_pending_parallel(&instance.id, &transition.current_step, &instance.data, &pending, &transition.history, &transition.completed_steps, instance.retry_count)
                    .await?;
            }
        }

        if matches!(step.next_step_strategy, NextStepStrategy::Terminal) {
            tracing::info!(process_id = %instance.id, "Process completed");
        }

        Ok(())
    }

    /// spec §4.5 step 3: update the pending parallel set on each branch
    /// reply, and resolve the region once every branch has reported.
    async fn advance_parallel_branch(
        &self,
        instance: ProcessInstance,
        config: &ProcessConfiguration,
        pending: &mut PendingParallel,
        command_id: Uuid,
        outcome: StepOutcome,
    ) -> Result<(), ProcessError> {
        let branch_name = pending
            .branch_commands
            .iter()
            .find(|(_, id)| **id == command_id)
            .map(|(name, _)| name.clone());

        if let Some(branch) = branch_name {
            match outcome {
                StepOutcome::Succeeded => {
                    pending.completed.push(branch.clone());
                    pending.completion_order.push(branch);
                }
                StepOutcome::Failed => pending.failed.push(branch),
            }
        }

        if !pending.is_resolved() {
            self.persist_pending_parallel(
                &instance.id,
                &instance.current_step,
                &instance.data,
                pending,
                &instance.history(),
                &instance.completed_steps(),
                instance.retry_count,
            )
            .await?;
            return Ok(());
        }

        if pending.failed.is_empty() {
            let join = config
                .step(&pending.join_step)
                .ok_or_else(|| ProcessError::UnknownStep(pending.join_step.clone()))?;

            let transition = Transition {
                current_step: pending.join_step.clone(),
                status: ProcessStatus::Running,
                pending_parallel: None,
                history: instance.history(),
                completed_steps: instance.completed_steps(),
                schedule: vec![join],
            };
            self.commit_transition(&instance, &transition).await?;
        } else {
            // spec §4.5: compensate successfully completed branches, in
            // reverse completion order, sequentially.
            let reverse_order: Vec<String> = pending.completion_order.iter().rev().cloned().collect();
            self.persist_pending_parallel(
                &instance.id,
                &instance.current_step,
                &instance.data,
                pending,
                &instance.history(),
                &instance.completed_steps(),
                instance.retry_count,
            )
            .await?;
            self.compensate_next(&instance, config, &reverse_order).await?;
        }

        Ok(())
    }

    /// spec §4.5 step 1: a non-parallel step failed. Begin compensating the
    /// steps already completed in this execution path, in reverse order.
    async fn begin_compensation(
        &self,
        instance: ProcessInstance,
        config: &ProcessConfiguration,
    ) -> Result<(), ProcessError> {
        let completed_steps = instance.completed_steps();
        let reverse_order: Vec<String> = completed_steps.iter().rev().cloned().collect();

        let transition = Transition {
            current_step: instance.current_step.clone(),
            status: ProcessStatus::Compensating,
            pending_parallel: None,
            history: instance.history(),
            completed_steps,
            schedule: Vec::new(),
        };
        self.commit_transition(&instance, &transition).await?;

        self.compensate_next(&instance, config, &reverse_order).await
    }

    async fn compensate_next(
        &self,
        instance: &ProcessInstance,
        config: &ProcessConfiguration,
        remaining: &[String],
    ) -> Result<(), ProcessError> {
        let Some((step_name, rest)) = remaining.split_first() else {
            // Nothing left to compensate; the process is terminally failed.
            let transition = Transition {
                current_step: instance.current_step.clone(),
                status: ProcessStatus::Failed,
                pending_parallel: None,
                history: instance.history(),
                completed_steps: Vec::new(),
                schedule: Vec::new(),
            };
            self.commit_transition(instance, &transition).await?;
            tracing::warn!(process_id = %instance.id, "Process compensation complete, process failed");
            return Ok(());
        };

        let step = config
            .step(step_name)
            .ok_or_else(|| ProcessError::UnknownStep(step_name.clone()))?;

        let Some(compensation_type) = step.compensation_command_type.clone() else {
            // No compensation declared for this step; skip to the next one.
            return Box::pin(self.compensate_next(instance, config, rest)).await;
        };

        let compensation_step = ProcessStep {
            name: format!("{step_name}__compensate"),
            command_type: compensation_type,
            compensation_command_type: None,
            next_step_strategy: NextStepStrategy::Terminal,
        };

        let transition = Transition {
            current_step: instance.current_step.clone(),
            status: ProcessStatus::Compensating,
            pending_parallel: None,
            history: instance.history(),
            completed_steps: rest.to_vec(),
            schedule: vec![&compensation_step],
        };
        self.commit_transition(instance, &transition).await?;

        Ok(())
    }

    /// Continuation of compensation once a compensating command's reply
    /// arrives; advances to the next step still awaiting compensation.
    async fn advance_compensation(
        &self,
        instance: ProcessInstance,
        config: &ProcessConfiguration,
    ) -> Result<(), ProcessError> {
        let remaining = instance.completed_steps();
        self.compensate_next(&instance, config, &remaining).await
    }

    /// Persists `transition` and schedules every step in `transition.schedule`
    /// inside one database transaction, then fires fast-path notifications
    /// after commit (spec §4.5 "Determinism"). Returns the command ids
    /// assigned to each scheduled step, in the same order.
    async fn commit_transition(
        &self,
        instance: &ProcessInstance,
        transition: &Transition<'_>,
    ) -> Result<Vec<Uuid>, ProcessError> {
        let mut tx = self.store.pool().begin().await?;

        let mut command_ids = Vec::new();
        let mut outbox_ids = Vec::new();
        for step in &transition.schedule {
            let idempotency_key = format!("{}:{}:{}", instance.id, step.name, instance.retry_count);
            let mut headers = HashMap::new();
            headers.insert("processId".to_string(), instance.id.to_string());
            let reply_routing = ReplyRouting {
                reply_to: Some(self.reply_queue.clone()),
                correlation_id: Some(instance.id.to_string()),
                headers,
            };

            let (command_id, outbox_id) = self
                .command_bus
                .accept_in_tx(
                    &mut tx,
                    &step.command_type,
                    &idempotency_key,
                    &instance.business_key,
                    &instance.data,
                    &reply_routing,
                )
                .await?;

            command_ids.push(command_id);
            outbox_ids.push(outbox_id);
        }

        // A non-parallel schedule has at most one command: that command id
        // is what `onReply` must find this instance by. Parallel regions
        // track their branch command ids in `pending_parallel` instead.
        let current_command_id = if transition.pending_parallel.is_none() {
            command_ids.first().copied()
        } else {
            None
        };

        self.store
            .save(
                &mut tx,
                instance.id,
                &transition.current_step,
                transition.status,
                &instance.data,
                transition.pending_parallel.as_ref(),
                &transition.history,
                &transition.completed_steps,
                current_command_id,
                instance.retry_count,
            )
            .await?;

        tx.commit().await?;
        for outbox_id in outbox_ids {
            self.command_bus.notify(outbox_id);
        }

        Ok(command_ids)
    }

    /// Single-step schedule helper used by `start`, sharing the caller's
    /// open transaction.
    async fn schedule_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        process_id: Uuid,
        business_key: &str,
        data: &serde_json::Value,
        step: &ProcessStep,
        retry_count: i32,
    ) -> Result<(Uuid, i64), ProcessError> {
        let idempotency_key = format!("{process_id}:{}:{retry_count}", step.name);
        let mut headers = HashMap::new();
        headers.insert("processId".to_string(), process_id.to_string());
        let reply_routing = ReplyRouting {
            reply_to: Some(self.reply_queue.clone()),
            correlation_id: Some(process_id.to_string()),
            headers,
        };

        let result = self
            .command_bus
            .accept_in_tx(tx, &step.command_type, &idempotency_key, business_key, data, &reply_routing)
            .await?;
        Ok(result)
    }

    /// Records branch command ids (only known after scheduling) or an
    /// updated pending-parallel set, without scheduling anything further.
    #[allow(clippy::too_many_arguments)]
    async fn persist_pending_parallel(
        &self,
        id: &Uuid,
        current_step: &str,
        data: &serde_json::Value,
        pending: &PendingParallel,
        history: &[HistoryEntry],
        completed_steps: &[String],
        retry_count: i32,
    ) -> Result<(), ProcessError> {
        let mut tx = self.store.pool().begin().await?;
        self.store
            .save(
                &mut tx,
                *id,
                current_step,
                ProcessStatus::Waiting,
                data,
                Some(pending),
                history,
                completed_steps,
                None,
                retry_count,
            )
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_obj {
            base_obj.insert(key.clone(), value.clone());
        }
    }
}
