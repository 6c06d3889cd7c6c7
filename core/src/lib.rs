//! Command bus, transactional outbox relay, worker runtime, and process
//! manager for reliable command/event delivery.

pub mod command;
pub mod command_bus;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod http;
pub mod inbox;
pub mod metrics;
pub mod notifier;
pub mod outbox;
pub mod process;
pub mod queue_naming;
pub mod relay;
pub mod reply_dispatcher;
pub mod worker;

pub use command::{Command, CommandStatus, CommandStore, ReplyRouting};
pub use command_bus::CommandBus;
pub use config::Config;
pub use dlq::{DlqEntry, DlqStore};
pub use envelope::WireEnvelope;
pub use error::{CommandBusError, ConfigurationError, OutboxError, ProcessError};
pub use handler::{CommandHandler, CommandMessage, CommandReply, FnHandler, HandlerOutcome, HandlerRegistry};
pub use inbox::InboxStore;
pub use metrics::{RelayMetrics, WorkerMetrics};
pub use notifier::{FastPathNotifier, FastPathReceiver, TxContext};
pub use outbox::{NewOutboxMessage, OutboxCategory, OutboxMessage, OutboxStore};
pub use process::{
    NextStepStrategy, ProcessConfiguration, ProcessInstance, ProcessManager, ProcessRegistry,
    ProcessRegistryBuilder, ProcessStatus, ProcessStep, ProcessStore, StepOutcome,
};
pub use relay::RelayWorkerId;
pub use reply_dispatcher::{ReplyDispatcher, ReplyOutcome};
pub use worker::WorkerRuntime;
