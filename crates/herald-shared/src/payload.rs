//! Fan-out payloads.
//!
//! [`ReceivedMessage`] is the shape delivered to `on_message` subscribers and
//! serialised into the `data` field of the `message.received` webhook event.
//! Field names are part of the outbound wire format; do not rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub chat_jid: String,
    pub chat_name: String,
    pub msg_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_jid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caption: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_optionals_are_omitted() {
        let msg = ReceivedMessage {
            chat_jid: "1@s.whatsapp.net".into(),
            chat_name: "Alice".into(),
            msg_id: "m1".into(),
            sender_jid: String::new(),
            sender_name: String::new(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            from_me: true,
            text: "hi".into(),
            media_type: String::new(),
            caption: String::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"chat_jid\""));
        assert!(!json.contains("sender_jid"));
        assert!(!json.contains("media_type"));
    }
}
