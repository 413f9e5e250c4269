//! Envelope parsing.
//!
//! One parser serves both ingest paths. Live events and history replays
//! differ only in where the chat address comes from; the field extraction is
//! identical, so a history replay can never silently lose media metadata
//! that a live parse would have kept.

use herald_shared::{Addr, MediaInfo, Message};

use crate::events::{EnvelopeContent, MessageEnvelope};

/// Parse a live message event. `None` for control frames (empty id) and for
/// envelopes without a chat.
pub fn parse_live(env: &MessageEnvelope) -> Option<Message> {
    let chat = env.chat.clone()?;
    parse_envelope(chat, env)
}

/// Parse a message from a history-sync conversation, which carries the chat
/// as an attribute of the surrounding batch.
pub fn parse_history(chat: &Addr, env: &MessageEnvelope) -> Option<Message> {
    // A history envelope may still name its chat; the conversation id wins
    // only when it does not.
    let chat = env.chat.clone().unwrap_or_else(|| chat.clone());
    parse_envelope(chat, env)
}

fn parse_envelope(chat: Addr, env: &MessageEnvelope) -> Option<Message> {
    if env.id.is_empty() {
        return None;
    }

    let sender = if env.from_me {
        String::new()
    } else {
        env.sender
            .as_ref()
            .map(|s| s.base().to_string())
            .unwrap_or_default()
    };

    let (text, media) = match &env.content {
        EnvelopeContent::Text(text) => (text.clone(), None),
        EnvelopeContent::Media(m) => (
            String::new(),
            Some(MediaInfo {
                kind: Some(m.kind),
                caption: m.caption.clone(),
                filename: m.filename.clone(),
                mime_type: m.mime_type.clone(),
                direct_path: m.direct_path.clone(),
                media_key: m.media_key.clone(),
                plaintext_sha256: m.plaintext_sha256.clone(),
                encrypted_sha256: m.encrypted_sha256.clone(),
                byte_length: m.byte_length,
                local_path: String::new(),
                downloaded_at: None,
            }),
        ),
        EnvelopeContent::Unsupported => return None,
    };

    Some(Message {
        chat: chat.base(),
        id: env.id.clone(),
        sender,
        chat_name: String::new(),
        sender_name: env.push_name.clone(),
        ts: env.ts,
        from_me: env.from_me,
        text,
        media,
    })
}
