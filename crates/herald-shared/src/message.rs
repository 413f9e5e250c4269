//! The canonical message shape shared by live ingest, history replay, and
//! the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::addr::Addr;

/// Media classification, derived from the MIME type prefix on send and from
/// the protocol message variant on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }

    /// Classify from a MIME type. Anything that is not image/video/audio is
    /// sent as a document.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            MediaKind::Image
        } else if mime.starts_with("video/") {
            MediaKind::Video
        } else if mime.starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Document
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "document" => Some(MediaKind::Document),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media metadata attached to a message.
///
/// `media_key`, `direct_path` and the two hashes are everything the protocol
/// needs to re-download and decrypt the payload later; the parser must carry
/// them through even for history-sync replays. `local_path` stays empty until
/// the media has actually been downloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub kind: Option<MediaKind>,
    pub caption: String,
    pub filename: String,
    pub mime_type: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub plaintext_sha256: Vec<u8>,
    pub encrypted_sha256: Vec<u8>,
    pub byte_length: u64,
    pub local_path: String,
    pub downloaded_at: Option<DateTime<Utc>>,
}

impl MediaInfo {
    /// Whether enough metadata is present for a download to be possible.
    pub fn downloadable(&self) -> bool {
        !self.direct_path.is_empty() && !self.media_key.is_empty()
    }
}

/// A message in canonical form, keyed by `(chat, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub chat: Addr,
    pub id: String,
    /// Sender address string; empty for messages we sent ourselves.
    pub sender: String,
    /// Best-known chat label at observation time, denormalised for search.
    pub chat_name: String,
    /// Best-known sender label at observation time, denormalised for search.
    pub sender_name: String,
    pub ts: DateTime<Utc>,
    pub from_me: bool,
    pub text: String,
    pub media: Option<MediaInfo>,
}
