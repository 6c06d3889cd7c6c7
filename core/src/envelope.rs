//! Wire envelope published to the broker for every outbox row (spec §6
//! "Message envelope (broker-neutral)").
//!
//! `EventBus::publish` only carries a subject and raw bytes — unlike
//! `async_nats::Client`, the platform abstraction has no header channel
//! (`platform/event-bus::EventBus::publish`). Grounded on
//! `payments-rs::events::outbox::start_outbox_publisher`'s `full_envelope`
//! `serde_json::json!({...})` construction, which folds envelope metadata
//! and payload into one JSON body before handing it to `bus.publish`: this
//! module is the same fold, generalized to carry the arbitrary headers map
//! spec §3's outbox row and spec §6's envelope both name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What actually crosses the wire for a command/reply/event outbox row.
/// `headers` carries `commandId`, `commandName`, `businessKey`,
/// `correlationId`, `replyTo`, and any caller/process-supplied extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    pub type_: String,
    pub headers: HashMap<String, String>,
    pub payload: serde_json::Value,
}

impl WireEnvelope {
    pub fn new(type_: &str, headers: &HashMap<String, String>, payload: &serde_json::Value) -> Self {
        Self {
            type_: type_.to_string(),
            headers: headers.clone(),
            payload: payload.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_headers_and_payload() {
        let mut headers = HashMap::new();
        headers.insert("commandId".to_string(), "c1".to_string());
        let envelope = WireEnvelope::new("CommandRequested", &headers, &serde_json::json!({"a": 1}));

        let bytes = envelope.encode().unwrap();
        let decoded = WireEnvelope::decode(&bytes).unwrap();

        assert_eq!(decoded.header("commandId"), Some("c1"));
        assert_eq!(decoded.type_, "CommandRequested");
        assert_eq!(decoded.payload, serde_json::json!({"a": 1}));
    }
}
