//! Capability surface of the WhatsApp Multi-Device protocol client.
//!
//! The wire protocol itself (noise transport, pairing cryptography, media
//! encryption, `session.db`) lives behind the [`WaClient`] trait; this crate
//! defines the operations the daemon depends on, the event stream it
//! consumes, and the one parser that maps protocol message envelopes onto the
//! canonical message shape.

pub mod client;
pub mod events;
pub mod parse;
pub mod types;

mod error;

pub use client::WaClient;
pub use error::{WaError, WaResult};
pub use events::{
    EnvelopeContent, HistoryBatch, HistoryConversation, MediaEnvelope, MessageEnvelope, WaEvent,
};
pub use types::{
    ContactUpdate, DeviceIdentity, GroupParticipant, GroupSnapshot, HistoryAnchor,
    MediaDownloadRequest, OutgoingMedia, ParticipantAction, UploadHandle,
};
