//! The service manager.
//!
//! One instance owns the data directory lock, the store, exactly one
//! protocol client, and the sync engine's lifetime. It is the single public
//! face of the daemon: the HTTP and CLI layers in front of it only ever call
//! the operations defined here.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use herald_shared::{Addr, MediaKind, Message, ReceivedMessage, ServiceError, ServiceResult};
use herald_store::{Chat, Contact, Group, GroupMember, MediaDownloadInfo, MemberRole, SearchHit, Store};
use herald_wa::{
    DeviceIdentity, GroupSnapshot, MediaDownloadRequest, OutgoingMedia, ParticipantAction,
    WaClient, WaError, WaEvent,
};
use herald_webhook::Emitter;

use crate::config::Config;
use crate::lock::DataDirLock;
use crate::state::{State, StateMachine, StatusInfo};
use crate::sync::{BackfillResult, MessageHandler, SharedHandlers, SyncEngine, SyncHandle};

/// How long `initiate_auth` waits for a `Connected` event after the client's
/// connect call returns. Key exchange can fail silently after `PairSuccess`,
/// so pairing is only confirmed by `Connected` or a positive re-check.
const AUTH_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnect backoff cap.
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(120);

/// Constructs the protocol client for a data directory. The implementation
/// must apply the device identity before any pairing can take place.
pub type ClientFactory =
    Arc<dyn Fn(&Path, &DeviceIdentity) -> Result<Arc<dyn WaClient>, WaError> + Send + Sync>;

struct Core {
    lock: DataDirLock,
    store: Arc<Store>,
    client: Arc<dyn WaClient>,
    sync: Arc<SyncEngine>,
    sync_handle: tokio::sync::Mutex<Option<SyncHandle>>,
    supervisor: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

pub struct Manager {
    config: Config,
    device: DeviceIdentity,
    factory: ClientFactory,
    state: Arc<StateMachine>,
    webhook: Arc<Emitter>,
    handlers: SharedHandlers,
    core: tokio::sync::RwLock<Option<Core>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    pub state: State,
    pub ready: bool,
    pub version: &'static str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendFileResult {
    pub message_id: String,
    pub media_kind: MediaKind,
    pub filename: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadMediaResult {
    pub chat: String,
    pub msg_id: String,
    pub media_kind: String,
    pub mime_type: String,
    pub local_path: String,
    pub byte_length: u64,
    pub downloaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub state: State,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub data_dir: String,
    pub lock_held: bool,
    pub authenticated: bool,
    pub connected: bool,
    pub fts_enabled: bool,
    pub message_count: i64,
    pub chat_count: i64,
    pub contact_count: i64,
    pub group_count: i64,
}

impl Manager {
    /// Build a manager. Must run inside a tokio runtime: the webhook worker
    /// pool starts immediately.
    pub fn new(config: Config, device: DeviceIdentity, factory: ClientFactory) -> Self {
        let webhook = Emitter::start(config.webhook.clone());
        Self {
            config,
            device,
            factory,
            state: Arc::new(StateMachine::new()),
            webhook,
            handlers: SharedHandlers::default(),
            core: tokio::sync::RwLock::new(None),
        }
    }

    pub fn state(&self) -> State {
        self.state.state()
    }

    pub fn status(&self) -> StatusInfo {
        self.state.status()
    }

    pub fn health(&self) -> HealthInfo {
        let state = self.state.state();
        HealthInfo {
            state,
            ready: state.is_ready(),
            version: env!("CARGO_PKG_VERSION"),
            now: Utc::now(),
        }
    }

    /// The QR payload to render, or empty when no pairing is in progress.
    pub fn qr(&self) -> String {
        self.state.qr()
    }

    /// Register a subscriber for live messages. Callbacks run in their own
    /// task per message, after the store commit for that message.
    pub fn on_message(&self, handler: impl Fn(ReceivedMessage) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler) as MessageHandler);
    }

    /// Acquire the lock, open the store, construct the client, and begin
    /// connecting (or wait for `initiate_auth` when no session exists).
    pub async fn start(&self) -> ServiceResult<()> {
        let mut core_slot = self.core.write().await;
        if core_slot.is_some() {
            return Err(ServiceError::InvalidInput("manager already started".into()));
        }

        let lock = match DataDirLock::acquire(&self.config.data_dir) {
            Ok(lock) => lock,
            Err(err) => {
                self.state.set_error(err.to_string());
                return Err(err);
            }
        };

        let store = match Store::open(&self.config.data_dir) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                // The lock is released before surfacing the failure.
                drop(lock);
                let err = ServiceError::from(err);
                self.state.set_error(err.to_string());
                return Err(err);
            }
        };

        let client = match (self.factory)(&self.config.data_dir, &self.device) {
            Ok(client) => client,
            Err(err) => {
                drop(store);
                drop(lock);
                let err = ServiceError::from(err);
                self.state.set_error(err.to_string());
                return Err(err);
            }
        };

        let sync = SyncEngine::new(
            store.clone(),
            client.clone(),
            self.state.clone(),
            self.webhook.clone(),
            self.handlers.clone(),
            self.config.download_media,
        );
        let sync_handle = sync.spawn();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let supervisor = self.spawn_supervisor(client.clone(), store.clone(), cancel_rx);

        *core_slot = Some(Core {
            lock,
            store,
            client: client.clone(),
            sync,
            sync_handle: tokio::sync::Mutex::new(Some(sync_handle)),
            supervisor,
            cancel: cancel_tx,
        });
        drop(core_slot);

        // Initial connection attempt runs in the background; callers poll
        // status() or wait for the state machine.
        let state = self.state.clone();
        tokio::spawn(async move {
            state.set_state(State::Connecting);
            if client.is_authenticated() {
                match client.connect().await {
                    Ok(()) => state.set_state(State::Connected),
                    Err(err) => state.set_error(format!("connect failed: {err}")),
                }
            } else {
                tracing::info!("no stored session, waiting for pairing");
                state.set_state(State::Unauthenticated);
            }
        });

        Ok(())
    }

    /// Reconnection and post-connect side work, driven by state transitions.
    fn spawn_supervisor(
        &self,
        client: Arc<dyn WaClient>,
        store: Arc<Store>,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let (transitions_tx, mut transitions) = mpsc::unbounded_channel::<(State, State)>();
        self.state.on_change(move |old, new| {
            let _ = transitions_tx.send((old, new));
        });

        let state = self.state.clone();
        let refresh_contacts = self.config.refresh_contacts;
        let refresh_groups = self.config.refresh_groups;

        tokio::spawn(async move {
            loop {
                let transition = tokio::select! {
                    _ = cancel.changed() => break,
                    t = transitions.recv() => match t {
                        Some(t) => t,
                        None => break,
                    },
                };

                match transition {
                    (_, State::Connected) => {
                        side_sync(&client, &store, refresh_contacts, refresh_groups).await;
                    }
                    (_, State::Disconnected) if client.is_authenticated() => {
                        reconnect_loop(&client, &state, &mut cancel).await;
                    }
                    _ => {}
                }
            }
            tracing::debug!("supervisor stopped");
        })
    }

    /// Stop everything: sync engine, client, webhook workers, store, lock,
    /// released in that order, bounded by the shutdown budget.
    pub async fn stop(&self) -> ServiceResult<()> {
        let Some(core) = self.core.write().await.take() else {
            return Ok(());
        };

        let _ = core.cancel.send(true);

        // Drain phase: the sync engine and the webhook emitter both finish
        // their queued work (bounded by the shutdown budget) before any
        // resource is released.
        if let Some(handle) = core.sync_handle.lock().await.take() {
            handle.stop().await;
        }
        core.supervisor.abort();
        self.webhook.stop(self.config.shutdown_timeout).await;

        // Release phase, in reverse order of acquisition: client, store, lock.
        core.client.disconnect().await;
        core.client.close().await;

        drop(core.sync);
        drop(core.client);
        match Arc::try_unwrap(core.store) {
            Ok(store) => {
                if let Err(err) = store.close() {
                    tracing::warn!(error = %err, "store close failed");
                }
            }
            // A straggling task still holds the store; dropping the Arc
            // closes the connection without the final WAL truncate.
            Err(_) => tracing::debug!("store closed implicitly"),
        }
        drop(core.lock);

        self.state.set_state(State::Disconnected);
        tracing::info!("manager stopped");
        Ok(())
    }

    /// Run the QR pairing flow.
    ///
    /// The event subscription is taken *before* the connect call and held
    /// until `Connected` or `PairError` is observed (or the 30 s window
    /// closes): pairing key exchange continues after the QR scan is
    /// acknowledged, and dropping the subscription early loses it.
    pub async fn initiate_auth(&self) -> ServiceResult<()> {
        let (_store, client, _sync) = self.parts().await?;

        if self.state.state() == State::Connected {
            return Err(ServiceError::AlreadyAuthenticated);
        }

        tracing::info!("starting authentication flow");
        self.state.set_state(State::Connecting);

        // Subscribe before connect so no pairing event can be missed.
        let mut events = client.events();

        let (qr_tx, mut qr_rx) = mpsc::channel::<String>(8);
        let qr_state = self.state.clone();
        let qr_task = tokio::spawn(async move {
            while let Some(qr) = qr_rx.recv().await {
                tracing::info!(len = qr.len(), "QR code generated");
                qr_state.set_qr(qr);
            }
        });

        if let Err(err) = client.connect_with_qr(qr_tx).await {
            qr_task.abort();
            self.state.set_error(format!("authentication failed: {err}"));
            return Err(err.into());
        }

        let deadline = tokio::time::Instant::now() + AUTH_CONFIRM_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(WaEvent::Connected)) => {
                    tracing::info!("authentication confirmed by connected event");
                    break;
                }
                Ok(Ok(WaEvent::PairSuccess { device })) => {
                    // Not sufficient on its own: the handshake can still fail.
                    tracing::info!(device = %device, "pair success, awaiting connection");
                }
                Ok(Ok(WaEvent::PairError { reason })) => {
                    self.state.set_error(format!("pairing failed: {reason}"));
                    return Err(ServiceError::Protocol(format!("pairing failed: {reason}")));
                }
                Ok(Ok(WaEvent::Disconnected)) => {
                    tracing::warn!("disconnected during pairing");
                }
                Ok(Ok(_)) => {}
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(missed))) => {
                    tracing::warn!(missed, "pairing subscription lagged");
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                    // Losing the subscription mid-auth counts as a pair error.
                    self.state.set_error("event stream closed during pairing");
                    return Err(ServiceError::Protocol(
                        "event subscription lost during pairing".into(),
                    ));
                }
                Err(_elapsed) => {
                    if !client.is_authenticated() {
                        self.state
                            .set_error("authentication timed out waiting for connection");
                        return Err(ServiceError::Timeout);
                    }
                    tracing::info!("authentication complete despite missing connected event");
                    break;
                }
            }
        }

        if !client.is_authenticated() {
            self.state.set_error("authentication did not complete");
            return Err(ServiceError::Protocol(
                "authentication did not complete".into(),
            ));
        }

        self.state.clear_qr();
        self.state.set_state(State::Connected);
        tracing::info!("authentication successful");
        Ok(())
    }

    /// Unlink the device. Stored history is kept.
    pub async fn logout(&self) -> ServiceResult<()> {
        let (_store, client, _sync) = self.parts().await?;
        client.logout().await?;
        self.state.set_state(State::Unauthenticated);
        Ok(())
    }

    // --- Messaging ---

    pub async fn send_text(&self, to: &str, text: &str) -> ServiceResult<String> {
        self.require_ready()?;
        let (store, client, _sync) = self.parts().await?;
        let to = Addr::from_user_input(to)?.base();

        let message_id = client.send_text(&to, text).await?;

        let now = Utc::now();
        let chat_name = client.resolve_chat_name(&to, "").await;
        let sent = Message {
            chat: to.clone(),
            id: message_id.clone(),
            sender: String::new(),
            chat_name,
            sender_name: "me".to_string(),
            ts: now,
            from_me: true,
            text: text.to_string(),
            media: None,
        };
        self.record_sent(&store, &sent);

        Ok(message_id)
    }

    pub async fn send_file(
        &self,
        to: &str,
        data: Vec<u8>,
        filename: &str,
        caption: &str,
        mime_type: &str,
    ) -> ServiceResult<SendFileResult> {
        self.require_ready()?;
        if data.is_empty() {
            return Err(ServiceError::invalid_input("file data is empty"));
        }
        let (store, client, _sync) = self.parts().await?;
        let to = Addr::from_user_input(to)?.base();

        let mime_type = if mime_type.is_empty() {
            detect_mime(filename, &data)
        } else {
            mime_type.to_string()
        };
        let kind = MediaKind::from_mime(&mime_type);

        let upload = client.upload(&data, kind).await?;
        let message_id = client
            .send_media(
                &to,
                OutgoingMedia {
                    kind,
                    mime_type: mime_type.clone(),
                    filename: filename.to_string(),
                    caption: caption.to_string(),
                    upload: upload.clone(),
                },
            )
            .await?;

        let now = Utc::now();
        let chat_name = client.resolve_chat_name(&to, "").await;
        let sent = Message {
            chat: to.clone(),
            id: message_id.clone(),
            sender: String::new(),
            chat_name,
            sender_name: "me".to_string(),
            ts: now,
            from_me: true,
            text: caption.to_string(),
            media: Some(herald_shared::MediaInfo {
                kind: Some(kind),
                caption: caption.to_string(),
                filename: filename.to_string(),
                mime_type: mime_type.clone(),
                direct_path: upload.direct_path.clone(),
                media_key: upload.media_key.clone(),
                plaintext_sha256: upload.plaintext_sha256.clone(),
                encrypted_sha256: upload.encrypted_sha256.clone(),
                byte_length: upload.byte_length,
                local_path: String::new(),
                downloaded_at: None,
            }),
        };
        self.record_sent(&store, &sent);

        Ok(SendFileResult {
            message_id,
            media_kind: kind,
            filename: filename.to_string(),
            mime_type,
        })
    }

    /// Write-back of a message we just sent. Failure to record never fails
    /// the send that already happened.
    fn record_sent(&self, store: &Store, msg: &Message) {
        let chat_key = msg.chat.to_string();
        if let Err(err) = store.upsert_chat(&chat_key, msg.chat.kind(), &msg.chat_name, msg.ts) {
            tracing::warn!(chat = %chat_key, error = %err, "failed to record sent chat");
            return;
        }
        if let Err(err) = store.upsert_message(msg) {
            tracing::warn!(chat = %chat_key, msg = %msg.id, error = %err, "failed to record sent message");
        }
    }

    // --- Media ---

    pub async fn get_media_info(&self, chat: &str, msg_id: &str) -> ServiceResult<MediaDownloadInfo> {
        let (store, _client, _sync) = self.parts().await?;
        let chat = Addr::from_user_input(chat)?.base().to_string();
        store
            .get_media_info(&chat, msg_id)
            .map_err(|_| ServiceError::NotFound(format!("no media for message {msg_id}")))
    }

    /// Download a message's media into `<data>/media/<chat>/<filename>`.
    /// Idempotent: an already-downloaded file is returned without touching
    /// the client.
    pub async fn download_media(
        &self,
        chat: &str,
        msg_id: &str,
    ) -> ServiceResult<DownloadMediaResult> {
        self.require_ready()?;
        let (store, client, _sync) = self.parts().await?;
        let chat = Addr::from_user_input(chat)?.base().to_string();
        perform_download(&store, &client, &chat, msg_id).await
    }

    // --- Store read-throughs ---

    pub async fn search_messages(&self, query: &str, limit: i64) -> ServiceResult<Vec<SearchHit>> {
        let (store, _client, _sync) = self.parts().await?;
        Ok(store.search(query, limit, None, None)?)
    }

    pub async fn list_chats(&self, filter: Option<&str>, limit: i64) -> ServiceResult<Vec<Chat>> {
        let (store, _client, _sync) = self.parts().await?;
        Ok(store.list_chats(filter, limit)?)
    }

    pub async fn list_messages(&self, chat: &str, limit: i64) -> ServiceResult<Vec<Message>> {
        let (store, _client, _sync) = self.parts().await?;
        let chat = Addr::from_user_input(chat)?.base().to_string();
        Ok(store.list_messages(&chat, limit)?)
    }

    // --- Contacts ---

    pub async fn list_contacts(
        &self,
        filter: Option<&str>,
        limit: i64,
    ) -> ServiceResult<Vec<Contact>> {
        let (store, _client, _sync) = self.parts().await?;
        Ok(store.list_contacts(filter, limit)?)
    }

    pub async fn get_contact(&self, addr: &str) -> ServiceResult<(Contact, Vec<String>)> {
        let (store, _client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base().to_string();
        let contact = store
            .get_contact(&addr)
            .map_err(|_| ServiceError::NotFound(format!("no contact {addr}")))?;
        let tags = store.get_tags(&addr)?;
        Ok((contact, tags))
    }

    /// Import the upstream contact list. Returns the number of contacts
    /// written. Aliases and tags survive untouched.
    pub async fn refresh_contacts(&self) -> ServiceResult<usize> {
        let (store, client, _sync) = self.parts().await?;
        let contacts = client.get_all_contacts().await?;
        let mut count = 0;
        for c in &contacts {
            let addr = c.address.base();
            if let Err(err) = store.upsert_contact(
                &addr.to_string(),
                addr.local(),
                &c.push_name,
                &c.full_name,
                &c.first_name,
                &c.business_name,
            ) {
                tracing::warn!(contact = %addr, error = %err, "contact upsert failed");
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    pub async fn set_alias(&self, addr: &str, alias: &str) -> ServiceResult<()> {
        let (store, _client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base().to_string();
        Ok(store.set_alias(&addr, alias)?)
    }

    pub async fn clear_alias(&self, addr: &str) -> ServiceResult<()> {
        let (store, _client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base().to_string();
        store.clear_alias(&addr)?;
        Ok(())
    }

    pub async fn add_tag(&self, addr: &str, tag: &str) -> ServiceResult<()> {
        if tag.trim().is_empty() {
            return Err(ServiceError::invalid_input("tag must not be empty"));
        }
        let (store, _client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base().to_string();
        Ok(store.add_tag(&addr, tag)?)
    }

    pub async fn remove_tag(&self, addr: &str, tag: &str) -> ServiceResult<()> {
        let (store, _client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base().to_string();
        store.remove_tag(&addr, tag)?;
        Ok(())
    }

    // --- Groups ---

    pub async fn list_groups(&self, filter: Option<&str>, limit: i64) -> ServiceResult<Vec<Group>> {
        let (store, _client, _sync) = self.parts().await?;
        Ok(store.list_groups(filter, limit)?)
    }

    pub async fn group_members(&self, addr: &str) -> ServiceResult<Vec<GroupMember>> {
        let (store, _client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base().to_string();
        Ok(store.get_group_members(&addr)?)
    }

    /// Live group info from upstream; the local snapshot is refreshed on the
    /// way through.
    pub async fn group_info(&self, addr: &str) -> ServiceResult<GroupSnapshot> {
        self.require_ready()?;
        let (store, client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base();
        let snapshot = client.get_group_info(&addr).await?;
        if let Err(err) = store_group_snapshot(&store, &snapshot) {
            tracing::warn!(group = %addr, error = %err, "group snapshot write failed");
        }
        Ok(snapshot)
    }

    /// Import joined groups. Returns the number written.
    pub async fn refresh_groups(&self) -> ServiceResult<usize> {
        let (store, client, _sync) = self.parts().await?;
        let groups = client.get_joined_groups().await?;
        let mut count = 0;
        for g in &groups {
            if let Err(err) = store_group_snapshot(&store, g) {
                tracing::warn!(group = %g.address, error = %err, "group upsert failed");
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    pub async fn rename_group(&self, addr: &str, name: &str) -> ServiceResult<()> {
        self.require_ready()?;
        let (store, client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base();
        client.set_group_name(&addr, name).await?;
        if let Err(err) = store.upsert_group(&addr.to_string(), name, "", None) {
            tracing::warn!(group = %addr, error = %err, "group rename write-back failed");
        }
        Ok(())
    }

    pub async fn update_participants(
        &self,
        group: &str,
        users: &[String],
        action: ParticipantAction,
    ) -> ServiceResult<Vec<herald_wa::GroupParticipant>> {
        self.require_ready()?;
        let (_store, client, _sync) = self.parts().await?;
        let group = Addr::from_user_input(group)?.base();
        let mut user_addrs = Vec::with_capacity(users.len());
        for user in users {
            user_addrs.push(Addr::from_user_input(user)?.base());
        }
        Ok(client
            .update_participants(&group, &user_addrs, action)
            .await?)
    }

    pub async fn invite_link(&self, group: &str) -> ServiceResult<String> {
        self.require_ready()?;
        let (_store, client, _sync) = self.parts().await?;
        let group = Addr::from_user_input(group)?.base();
        Ok(client.invite_link(&group, false).await?)
    }

    pub async fn revoke_invite_link(&self, group: &str) -> ServiceResult<String> {
        self.require_ready()?;
        let (_store, client, _sync) = self.parts().await?;
        let group = Addr::from_user_input(group)?.base();
        Ok(client.invite_link(&group, true).await?)
    }

    pub async fn join_group(&self, code: &str) -> ServiceResult<String> {
        self.require_ready()?;
        let (_store, client, _sync) = self.parts().await?;
        let joined = client.join_with_invite(code).await?;
        Ok(joined.to_string())
    }

    pub async fn leave_group(&self, addr: &str) -> ServiceResult<()> {
        self.require_ready()?;
        let (_store, client, _sync) = self.parts().await?;
        let addr = Addr::from_user_input(addr)?.base();
        Ok(client.leave_group(&addr).await?)
    }

    // --- Sync control ---

    pub async fn backfill(
        &self,
        chat: &str,
        count: u32,
        requests: u32,
        wait: Duration,
    ) -> ServiceResult<BackfillResult> {
        let (_store, _client, sync) = self.parts().await?;
        let chat = Addr::from_user_input(chat)?.base();
        sync.backfill(&chat, count, requests, wait).await
    }

    pub async fn sync_status(&self) -> SyncStatus {
        let running = match self.core.read().await.as_ref() {
            Some(core) => core
                .sync_handle
                .lock()
                .await
                .as_ref()
                .map(|h| h.is_running())
                .unwrap_or(false),
            None => false,
        };
        SyncStatus {
            running,
            state: self.state.state(),
        }
    }

    pub async fn start_sync(&self) -> ServiceResult<()> {
        let guard = self.core.read().await;
        let core = guard
            .as_ref()
            .ok_or_else(|| ServiceError::not_ready(self.state.state().to_string()))?;
        let mut slot = core.sync_handle.lock().await;
        if slot.as_ref().map(|h| h.is_running()).unwrap_or(false) {
            return Err(ServiceError::invalid_input("sync is already running"));
        }
        *slot = Some(core.sync.spawn());
        Ok(())
    }

    pub async fn stop_sync(&self) -> ServiceResult<()> {
        let guard = self.core.read().await;
        let core = guard
            .as_ref()
            .ok_or_else(|| ServiceError::not_ready(self.state.state().to_string()))?;
        let handle = core.sync_handle.lock().await.take();
        match handle {
            Some(handle) if handle.is_running() => {
                handle.stop().await;
                Ok(())
            }
            _ => Err(ServiceError::invalid_input("sync is not running")),
        }
    }

    // --- Diagnostics ---

    pub async fn diagnostics(&self) -> ServiceResult<Diagnostics> {
        let guard = self.core.read().await;
        let Some(core) = guard.as_ref() else {
            return Ok(Diagnostics {
                data_dir: self.config.data_dir.display().to_string(),
                lock_held: false,
                authenticated: false,
                connected: false,
                fts_enabled: false,
                message_count: 0,
                chat_count: 0,
                contact_count: 0,
                group_count: 0,
            });
        };

        let stats = core.store.stats()?;
        Ok(Diagnostics {
            data_dir: self.config.data_dir.display().to_string(),
            lock_held: true,
            authenticated: core.client.is_authenticated(),
            connected: core.client.is_connected(),
            fts_enabled: stats.fts_enabled,
            message_count: stats.messages,
            chat_count: stats.chats,
            contact_count: stats.contacts,
            group_count: stats.groups,
        })
    }

    // --- Internals ---

    fn require_ready(&self) -> ServiceResult<()> {
        let state = self.state.state();
        if !state.is_ready() {
            return Err(ServiceError::not_ready(state.to_string()));
        }
        Ok(())
    }

    async fn parts(
        &self,
    ) -> ServiceResult<(Arc<Store>, Arc<dyn WaClient>, Arc<SyncEngine>)> {
        let guard = self.core.read().await;
        match guard.as_ref() {
            Some(core) => Ok((core.store.clone(), core.client.clone(), core.sync.clone())),
            None => Err(ServiceError::not_ready(self.state.state().to_string())),
        }
    }
}

/// Refresh contacts and groups after a (re)connect, per configuration.
async fn side_sync(
    client: &Arc<dyn WaClient>,
    store: &Arc<Store>,
    refresh_contacts: bool,
    refresh_groups: bool,
) {
    if refresh_contacts {
        match client.get_all_contacts().await {
            Ok(contacts) => {
                let mut count = 0;
                for c in &contacts {
                    let addr = c.address.base();
                    if store
                        .upsert_contact(
                            &addr.to_string(),
                            addr.local(),
                            &c.push_name,
                            &c.full_name,
                            &c.first_name,
                            &c.business_name,
                        )
                        .is_ok()
                    {
                        count += 1;
                    }
                }
                tracing::info!(count, "contacts refreshed after connect");
            }
            Err(err) => tracing::warn!(error = %err, "contact refresh failed"),
        }
    }
    if refresh_groups {
        match client.get_joined_groups().await {
            Ok(groups) => {
                let mut count = 0;
                for g in &groups {
                    if store_group_snapshot(store, g).is_ok() {
                        count += 1;
                    }
                }
                tracing::info!(count, "groups refreshed after connect");
            }
            Err(err) => tracing::warn!(error = %err, "group refresh failed"),
        }
    }
}

/// Reconnect with exponential backoff: 1, 2, 4, ... capped at 120 s.
async fn reconnect_loop(
    client: &Arc<dyn WaClient>,
    state: &Arc<StateMachine>,
    cancel: &mut watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        if state.state() != State::Disconnected {
            return;
        }
        tokio::select! {
            _ = cancel.changed() => return,
            _ = tokio::time::sleep(backoff) => {}
        }

        state.set_state(State::Connecting);
        match client.connect().await {
            Ok(()) => {
                state.set_state(State::Connected);
                tracing::info!("reconnected");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, backoff_secs = backoff.as_secs(), "reconnect attempt failed");
                state.set_state(State::Disconnected);
                backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
            }
        }
    }
}

/// Fetch, decrypt, and record a message's media. Shared by the manager
/// operation and the sync engine's auto-download.
pub(crate) async fn perform_download(
    store: &Arc<Store>,
    client: &Arc<dyn WaClient>,
    chat: &str,
    msg_id: &str,
) -> ServiceResult<DownloadMediaResult> {
    let info = store
        .get_media_info(chat, msg_id)
        .map_err(|_| ServiceError::NotFound(format!("no media for message {msg_id}")))?;
    let media = info.media;

    if !media.local_path.is_empty() {
        return Ok(DownloadMediaResult {
            chat: chat.to_string(),
            msg_id: msg_id.to_string(),
            media_kind: media.kind.map(|k| k.as_str().to_string()).unwrap_or_default(),
            mime_type: media.mime_type,
            local_path: media.local_path,
            byte_length: media.byte_length,
            downloaded_at: media.downloaded_at,
        });
    }

    let request = MediaDownloadRequest::from_media(&media)
        .ok_or_else(|| ServiceError::invalid_input("message has no downloadable media metadata"))?;

    let dir = store.media_dir(chat);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ServiceError::Storage(format!("create media dir: {e}")))?;

    let filename = if media.filename.is_empty() {
        format!(
            "{}{}",
            uuid::Uuid::new_v4(),
            extension_for_mime(&media.mime_type)
        )
    } else {
        sanitize_filename(&media.filename)
    };
    let target = dir.join(filename);

    let byte_length = client.download_media(&request, &target).await?;

    let now = Utc::now();
    let local_path = target.display().to_string();
    store
        .mark_downloaded(chat, msg_id, &local_path, now)
        .map_err(ServiceError::from)?;

    Ok(DownloadMediaResult {
        chat: chat.to_string(),
        msg_id: msg_id.to_string(),
        media_kind: media.kind.map(|k| k.as_str().to_string()).unwrap_or_default(),
        mime_type: media.mime_type,
        local_path,
        byte_length,
        downloaded_at: Some(now),
    })
}

/// Persist a group snapshot (row plus member list).
pub(crate) fn store_group_snapshot(
    store: &Store,
    snapshot: &GroupSnapshot,
) -> Result<(), herald_store::StoreError> {
    let addr = snapshot.address.base().to_string();
    let owner = snapshot
        .owner
        .as_ref()
        .map(|o| o.base().to_string())
        .unwrap_or_default();
    store.upsert_group(&addr, &snapshot.name, &owner, snapshot.created_at)?;

    let members: Vec<(String, MemberRole)> = snapshot
        .participants
        .iter()
        .map(|p| {
            let role = if p.is_superadmin {
                MemberRole::Superadmin
            } else if p.is_admin {
                MemberRole::Admin
            } else {
                MemberRole::Member
            };
            (p.address.base().to_string(), role)
        })
        .collect();
    store.replace_group_members(&addr, &members)
}

/// MIME detection: extension first, then a content sniff over the first
/// 512 bytes, then the generic fallback.
fn detect_mime(filename: &str, data: &[u8]) -> String {
    if let Some(mime) = mime_guess::from_path(filename).first_raw() {
        return mime.to_string();
    }
    let head = &data[..data.len().min(512)];
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    "application/octet-stream".to_string()
}

/// File extension (with dot) for a MIME type, for generated media filenames.
fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "video/mp4" => ".mp4",
        "video/3gpp" => ".3gp",
        "audio/ogg" | "audio/ogg; codecs=opus" => ".ogg",
        "audio/mpeg" => ".mp3",
        "audio/mp4" => ".m4a",
        "application/pdf" => ".pdf",
        _ => ".bin",
    }
}

/// Keep filenames inside the media directory: path separators and control
/// characters are replaced.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0'..='\x1f' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        trimmed.to_string()
    }
}
