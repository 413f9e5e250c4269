//! Test double for the protocol client plus fixture helpers.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

use herald_daemon::{ClientFactory, Config, Manager};
use herald_shared::{Addr, MediaKind};
use herald_wa::{
    ContactUpdate, DeviceIdentity, EnvelopeContent, GroupParticipant, GroupSnapshot, HistoryAnchor,
    HistoryBatch, HistoryConversation, MediaDownloadRequest, MessageEnvelope, OutgoingMedia,
    ParticipantAction, UploadHandle, WaClient, WaError, WaEvent, WaResult,
};

pub struct FakeClient {
    events_tx: broadcast::Sender<WaEvent>,
    pub authenticated: Arc<AtomicBool>,
    pub connected: Arc<AtomicBool>,
    /// Number of upcoming `connect` calls that should fail.
    pub fail_connects: AtomicU32,
    pub connect_calls: AtomicU32,
    pub download_calls: AtomicU32,
    /// QR payloads pushed during `connect_with_qr`.
    pub qr_codes: Mutex<Vec<String>>,
    /// Events replayed shortly after `connect_with_qr` returns.
    pub pair_script: Mutex<Vec<WaEvent>>,
    /// History batches served by `request_history`, in order.
    pub history_script: Mutex<VecDeque<HistoryBatch>>,
    pub chat_names: Mutex<HashMap<String, String>>,
    pub contacts: Mutex<Vec<ContactUpdate>>,
    pub groups: Mutex<Vec<GroupSnapshot>>,
    pub sent_texts: Mutex<Vec<(String, String)>>,
    pub sent_media: Mutex<Vec<(String, String)>>,
    next_msg_id: AtomicU32,
    /// Byte count written by a successful media download.
    pub download_size: usize,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            events_tx,
            authenticated: Arc::new(AtomicBool::new(true)),
            connected: Arc::new(AtomicBool::new(false)),
            fail_connects: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            download_calls: AtomicU32::new(0),
            qr_codes: Mutex::new(Vec::new()),
            pair_script: Mutex::new(Vec::new()),
            history_script: Mutex::new(VecDeque::new()),
            chat_names: Mutex::new(HashMap::new()),
            contacts: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            sent_texts: Mutex::new(Vec::new()),
            sent_media: Mutex::new(Vec::new()),
            next_msg_id: AtomicU32::new(1),
            download_size: 1024,
        })
    }

    /// Inject an event as if the wire had produced it.
    pub fn publish(&self, event: WaEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn factory(self: &Arc<Self>) -> ClientFactory {
        let client = self.clone();
        Arc::new(move |_dir: &Path, _device: &DeviceIdentity| {
            Ok(client.clone() as Arc<dyn WaClient>)
        })
    }

    fn mint_msg_id(&self) -> String {
        format!("sent-{}", self.next_msg_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl WaClient for FakeClient {
    fn events(&self) -> broadcast::Receiver<WaEvent> {
        self.events_tx.subscribe()
    }

    async fn connect(&self) -> WaResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(WaError::Rejected("transport unavailable".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect_with_qr(&self, qr: mpsc::Sender<String>) -> WaResult<()> {
        let codes = self.qr_codes.lock().unwrap().clone();
        for code in codes {
            let _ = qr.send(code).await;
        }

        // The pairing key exchange continues after this call returns; replay
        // the scripted outcome with a delay so callers must keep listening.
        let script = std::mem::take(&mut *self.pair_script.lock().unwrap());
        let events_tx = self.events_tx.clone();
        let authenticated = self.authenticated.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            for event in script {
                match &event {
                    WaEvent::PairSuccess { .. } => authenticated.store(true, Ordering::SeqCst),
                    WaEvent::Connected => connected.store(true, Ordering::SeqCst),
                    _ => {}
                }
                let _ = events_tx.send(event);
            }
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {}

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> WaResult<()> {
        self.authenticated.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, to: &Addr, text: &str) -> WaResult<String> {
        if !self.is_connected() {
            return Err(WaError::NotConnected);
        }
        self.sent_texts
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        Ok(self.mint_msg_id())
    }

    async fn send_media(&self, to: &Addr, media: OutgoingMedia) -> WaResult<String> {
        if !self.is_connected() {
            return Err(WaError::NotConnected);
        }
        self.sent_media
            .lock()
            .unwrap()
            .push((to.to_string(), media.mime_type.clone()));
        Ok(self.mint_msg_id())
    }

    async fn upload(&self, bytes: &[u8], _kind: MediaKind) -> WaResult<UploadHandle> {
        Ok(UploadHandle {
            url: "https://mmg.whatsapp.net/u/fake".to_string(),
            direct_path: "/v/t62.7118-24/fake".to_string(),
            media_key: vec![9u8; 32],
            plaintext_sha256: vec![1u8; 32],
            encrypted_sha256: vec![2u8; 32],
            byte_length: bytes.len() as u64,
        })
    }

    async fn download_media(&self, _req: &MediaDownloadRequest, target: &Path) -> WaResult<u64> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(target, vec![0u8; self.download_size])
            .map_err(|e| WaError::Media(e.to_string()))?;
        Ok(self.download_size as u64)
    }

    async fn resolve_chat_name(&self, chat: &Addr, push_name: &str) -> String {
        if let Some(name) = self.chat_names.lock().unwrap().get(&chat.to_string()) {
            return name.clone();
        }
        if !push_name.is_empty() {
            return push_name.to_string();
        }
        chat.local().to_string()
    }

    async fn get_all_contacts(&self) -> WaResult<Vec<ContactUpdate>> {
        Ok(self.contacts.lock().unwrap().clone())
    }

    async fn get_joined_groups(&self) -> WaResult<Vec<GroupSnapshot>> {
        Ok(self.groups.lock().unwrap().clone())
    }

    async fn get_group_info(&self, group: &Addr) -> WaResult<GroupSnapshot> {
        self.groups
            .lock()
            .unwrap()
            .iter()
            .find(|g| g.address == *group)
            .cloned()
            .ok_or_else(|| WaError::Rejected(format!("unknown group {group}")))
    }

    async fn set_group_name(&self, _group: &Addr, _name: &str) -> WaResult<()> {
        Ok(())
    }

    async fn update_participants(
        &self,
        _group: &Addr,
        users: &[Addr],
        action: ParticipantAction,
    ) -> WaResult<Vec<GroupParticipant>> {
        Ok(users
            .iter()
            .map(|u| GroupParticipant {
                address: u.clone(),
                is_admin: action == ParticipantAction::Promote,
                is_superadmin: false,
            })
            .collect())
    }

    async fn invite_link(&self, group: &Addr, reset: bool) -> WaResult<String> {
        Ok(format!(
            "https://chat.whatsapp.com/{}{}",
            group.local(),
            if reset { "-new" } else { "" }
        ))
    }

    async fn join_with_invite(&self, code: &str) -> WaResult<Addr> {
        Ok(Addr::new(code, "g.us"))
    }

    async fn leave_group(&self, _group: &Addr) -> WaResult<()> {
        Ok(())
    }

    async fn request_history(
        &self,
        _chat: &Addr,
        _anchor: &HistoryAnchor,
        _count: u32,
    ) -> WaResult<()> {
        let batch = self.history_script.lock().unwrap().pop_front();
        if let Some(batch) = batch {
            let _ = self.events_tx.send(WaEvent::HistorySync(batch));
        }
        Ok(())
    }
}

// --- fixture helpers ---

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn text_envelope(chat: &str, id: &str, text: &str, at: i64) -> MessageEnvelope {
    let chat = Addr::parse(chat).unwrap();
    MessageEnvelope {
        id: id.to_string(),
        chat: Some(chat.clone()),
        sender: Some(chat),
        push_name: "Alice".to_string(),
        ts: ts(at),
        from_me: false,
        content: EnvelopeContent::Text(text.to_string()),
    }
}

pub fn media_envelope(chat: &str, id: &str, at: i64) -> MessageEnvelope {
    MessageEnvelope {
        content: EnvelopeContent::Media(herald_wa::events::MediaEnvelope {
            kind: MediaKind::Image,
            caption: "image cap".to_string(),
            filename: String::new(),
            mime_type: "image/jpeg".to_string(),
            direct_path: "/p/1".to_string(),
            media_key: vec![7u8; 16],
            plaintext_sha256: vec![1u8; 32],
            encrypted_sha256: vec![2u8; 32],
            byte_length: 1024,
        }),
        ..text_envelope(chat, id, "", at)
    }
}

pub fn history_batch(chat: &str, messages: Vec<MessageEnvelope>) -> HistoryBatch {
    HistoryBatch {
        conversations: vec![HistoryConversation {
            chat: chat.to_string(),
            messages,
        }],
    }
}

pub fn test_config(data_dir: &Path) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        // Exercised explicitly where a test wants it; implicit downloads
        // would race the assertions everywhere else.
        download_media: false,
        ..Config::default()
    }
}

pub fn manager_with(client: &Arc<FakeClient>, config: Config) -> Manager {
    Manager::new(config, DeviceIdentity::default(), client.factory())
}

/// Poll until `cond` holds, failing the test after five seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Async-condition variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}
