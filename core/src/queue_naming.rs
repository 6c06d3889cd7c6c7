//! Derives queue and topic names from the configured naming policy (spec §6).
//!
//! The command-queue name itself is derived by
//! `crate::command_bus::command_queue_topic`, the one production call site
//! for it; no duplicate lives here (spec §9 Open Question: don't carry
//! forward the source's duplicate declarations).

use crate::config::{QueueNaming, TopicNaming};

/// The single, shared reply queue.
pub fn reply_queue(naming: &QueueNaming) -> String {
    naming.reply_queue.clone()
}

/// `<event_prefix><command_name>`, e.g. `events.CreateUser`.
pub fn event_topic(naming: &TopicNaming, command_name: &str) -> String {
    format!("{}{}", naming.event_prefix, command_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_queue_is_stable() {
        assert_eq!(reply_queue(&QueueNaming::default()), "APP.CMD.REPLY.Q");
    }

    #[test]
    fn event_topic_uses_default_prefix() {
        let naming = TopicNaming::default();
        assert_eq!(event_topic(&naming, "CreateUser"), "events.CreateUser");
    }
}
