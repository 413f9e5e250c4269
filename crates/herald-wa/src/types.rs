use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herald_shared::{Addr, MediaInfo, MediaKind};

/// Identity presented to the upstream service at pairing time.
///
/// These fields must be in place before the first pairing; the upstream pins
/// them to the linked device and they cannot be corrected without
/// re-pairing. Client constructors take this struct for that reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub os_name: String,
    pub platform: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            os_name: "herald".to_string(),
            platform: "server".to_string(),
        }
    }
}

/// Result of uploading encrypted bytes to the protocol CDN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadHandle {
    pub url: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub plaintext_sha256: Vec<u8>,
    pub encrypted_sha256: Vec<u8>,
    pub byte_length: u64,
}

/// A typed outgoing media message, assembled from an upload handle.
#[derive(Debug, Clone)]
pub struct OutgoingMedia {
    pub kind: MediaKind,
    pub mime_type: String,
    pub filename: String,
    pub caption: String,
    pub upload: UploadHandle,
}

/// Everything the client needs to fetch, decrypt, and hash-verify stored
/// media.
#[derive(Debug, Clone)]
pub struct MediaDownloadRequest {
    pub kind: MediaKind,
    pub mime_type: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub plaintext_sha256: Vec<u8>,
    pub encrypted_sha256: Vec<u8>,
    pub byte_length: u64,
}

impl MediaDownloadRequest {
    /// Build a request from stored metadata. `None` when the row does not
    /// carry enough to download (no key or no CDN path).
    pub fn from_media(media: &MediaInfo) -> Option<Self> {
        if !media.downloadable() {
            return None;
        }
        Some(Self {
            kind: media.kind.unwrap_or(MediaKind::Document),
            mime_type: media.mime_type.clone(),
            direct_path: media.direct_path.clone(),
            media_key: media.media_key.clone(),
            plaintext_sha256: media.plaintext_sha256.clone(),
            encrypted_sha256: media.encrypted_sha256.clone(),
            byte_length: media.byte_length,
        })
    }
}

/// Candidate names pushed by the upstream contact list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactUpdate {
    pub address: Addr,
    pub push_name: String,
    pub full_name: String,
    pub first_name: String,
    pub business_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub address: Addr,
    pub is_admin: bool,
    pub is_superadmin: bool,
}

/// Group metadata as the upstream reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub address: Addr,
    pub name: String,
    pub owner: Option<Addr>,
    pub created_at: Option<DateTime<Utc>>,
    pub participants: Vec<GroupParticipant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

impl ParticipantAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(ParticipantAction::Add),
            "remove" => Some(ParticipantAction::Remove),
            "promote" => Some(ParticipantAction::Promote),
            "demote" => Some(ParticipantAction::Demote),
            _ => None,
        }
    }
}

/// The oldest stored message of a chat, used to anchor a history request.
#[derive(Debug, Clone)]
pub struct HistoryAnchor {
    pub message_id: String,
    pub ts: DateTime<Utc>,
    pub from_me: bool,
    pub sender: String,
}
