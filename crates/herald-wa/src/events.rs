//! Events delivered by the protocol client.
//!
//! Clients publish on a `tokio::sync::broadcast` channel. The sync engine
//! holds the long-lived subscription; the pairing flow takes a second, scoped
//! one that lives exactly from before `connect_with_qr` until the handshake
//! is confirmed. Key exchange continues after the QR scan acknowledgement,
//! so dropping the subscription early loses the pairing.

use chrono::{DateTime, Utc};

use herald_shared::{Addr, MediaKind};

use crate::types::{ContactUpdate, GroupSnapshot};

#[derive(Debug, Clone)]
pub enum WaEvent {
    /// One observed message, sent or received.
    Message(MessageEnvelope),
    /// A batched replay of prior conversations. Best effort; possibly
    /// incomplete.
    HistorySync(HistoryBatch),
    Connected,
    Disconnected,
    PairSuccess { device: String },
    PairError { reason: String },
    /// Optional pushes; not every client implementation emits these.
    ContactsPush(Vec<ContactUpdate>),
    GroupsPush(Vec<GroupSnapshot>),
}

/// The protocol's message envelope, projected to the fields the gateway
/// consumes.
///
/// Live events carry their chat in `chat`; history-sync messages leave it to
/// the surrounding [`HistoryConversation`]. An empty `id` marks a control
/// frame that carries no storable message.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub id: String,
    pub chat: Option<Addr>,
    pub sender: Option<Addr>,
    pub push_name: String,
    pub ts: DateTime<Utc>,
    pub from_me: bool,
    pub content: EnvelopeContent,
}

#[derive(Debug, Clone)]
pub enum EnvelopeContent {
    Text(String),
    Media(MediaEnvelope),
    /// Reactions, receipts, protocol bookkeeping. Parsed to nothing.
    Unsupported,
}

/// Media fields as they appear on the wire. Every one of them must survive
/// into the canonical shape, history replays included.
#[derive(Debug, Clone)]
pub struct MediaEnvelope {
    pub kind: MediaKind,
    pub caption: String,
    pub filename: String,
    pub mime_type: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub plaintext_sha256: Vec<u8>,
    pub encrypted_sha256: Vec<u8>,
    pub byte_length: u64,
}

#[derive(Debug, Clone)]
pub struct HistoryBatch {
    pub conversations: Vec<HistoryConversation>,
}

#[derive(Debug, Clone)]
pub struct HistoryConversation {
    /// Raw chat identifier as reported by the sync payload.
    pub chat: String,
    pub messages: Vec<MessageEnvelope>,
}
