//! The capability trait the daemon requires from a protocol client.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use herald_shared::Addr;

use crate::error::WaResult;
use crate::events::WaEvent;
use crate::types::{
    ContactUpdate, GroupParticipant, GroupSnapshot, HistoryAnchor, MediaDownloadRequest,
    OutgoingMedia, ParticipantAction, UploadHandle,
};

/// One linked WhatsApp Multi-Device client.
///
/// Implementations own `session.db` (device identity and ratchet state) and
/// everything cryptographic; the daemon only ever sees decrypted envelopes
/// and opaque handles. Exactly one client may run against a data directory;
/// the service layer enforces that with its file lock.
///
/// Implementations must apply the configured [`crate::DeviceIdentity`] during
/// construction, before any pairing can happen.
#[async_trait]
pub trait WaClient: Send + Sync {
    /// Subscribe to the event stream. Every subscriber sees every event from
    /// the moment it subscribes; lagging subscribers lose oldest events
    /// first.
    fn events(&self) -> broadcast::Receiver<WaEvent>;

    /// Connect using the stored session. Fails when no session exists.
    async fn connect(&self) -> WaResult<()>;

    /// Connect for pairing. Each fresh QR payload is pushed into `qr` as the
    /// upstream rotates them. Resolves once the QR flow completes; the
    /// pairing key exchange may still be in flight when it does, so callers
    /// must keep their event subscription until they observe `Connected` or
    /// `PairError`.
    async fn connect_with_qr(&self, qr: mpsc::Sender<String>) -> WaResult<()>;

    async fn disconnect(&self);

    /// Release sockets and the session store. The client is unusable
    /// afterwards.
    async fn close(&self);

    fn is_authenticated(&self) -> bool;
    fn is_connected(&self) -> bool;

    /// Unlink this device from the account. The stored session becomes
    /// invalid; the application store is untouched.
    async fn logout(&self) -> WaResult<()>;

    /// Send a text message. Returns the protocol-assigned message id.
    async fn send_text(&self, to: &Addr, text: &str) -> WaResult<String>;

    /// Send a typed media message previously uploaded with [`Self::upload`].
    async fn send_media(&self, to: &Addr, media: OutgoingMedia) -> WaResult<String>;

    /// Encrypt and upload bytes to the protocol CDN.
    async fn upload(
        &self,
        bytes: &[u8],
        kind: herald_shared::MediaKind,
    ) -> WaResult<UploadHandle>;

    /// Download, decrypt, and hash-verify media into `target`. Returns the
    /// decrypted byte count.
    async fn download_media(&self, req: &MediaDownloadRequest, target: &Path) -> WaResult<u64>;

    /// Best-effort human label for a chat. Never fails; falls back to the
    /// push name or the address string.
    async fn resolve_chat_name(&self, chat: &Addr, push_name: &str) -> String;

    async fn get_all_contacts(&self) -> WaResult<Vec<ContactUpdate>>;

    async fn get_joined_groups(&self) -> WaResult<Vec<GroupSnapshot>>;
    async fn get_group_info(&self, group: &Addr) -> WaResult<GroupSnapshot>;
    async fn set_group_name(&self, group: &Addr, name: &str) -> WaResult<()>;
    async fn update_participants(
        &self,
        group: &Addr,
        users: &[Addr],
        action: ParticipantAction,
    ) -> WaResult<Vec<GroupParticipant>>;

    /// Fetch the group invite link, minting a new one when `reset` is set.
    async fn invite_link(&self, group: &Addr, reset: bool) -> WaResult<String>;
    async fn join_with_invite(&self, code: &str) -> WaResult<Addr>;
    async fn leave_group(&self, group: &Addr) -> WaResult<()>;

    /// Ask the primary device for up to `count` messages older than the
    /// anchor. Results, if any, arrive later as a `HistorySync` event.
    async fn request_history(
        &self,
        chat: &Addr,
        anchor: &HistoryAnchor,
        count: u32,
    ) -> WaResult<()>;
}
