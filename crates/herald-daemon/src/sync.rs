//! Event ingest and backfill.
//!
//! A single task drains the client's event stream and turns it into store
//! writes. Ingest never surfaces errors to anyone: a write failure is logged
//! and the loop moves on, losing that one event. Fan-out (webhook plus
//! registered callbacks) happens only for live messages and only after the
//! store commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use herald_shared::{Addr, Message, ReceivedMessage, ServiceError, ServiceResult};
use herald_store::Store;
use herald_wa::{parse, HistoryAnchor, WaClient, WaEvent};
use herald_webhook::Emitter;

use crate::state::{State, StateMachine};

/// Callback registered through `Manager::on_message`. Every delivery runs in
/// its own task; a slow subscriber cannot stall ingest.
pub type MessageHandler = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

pub type SharedHandlers = Arc<RwLock<Vec<MessageHandler>>>;

/// Outcome of a backfill run.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillResult {
    pub chat: String,
    pub requests_sent: u32,
    pub responses_seen: u32,
    pub messages_added: i64,
}

pub struct SyncEngine {
    store: Arc<Store>,
    client: Arc<dyn WaClient>,
    state: Arc<StateMachine>,
    webhook: Arc<Emitter>,
    handlers: SharedHandlers,
    /// Fetch media for incoming live messages as they arrive.
    auto_download: bool,
    /// History batches observed since start; backfill watches this to detect
    /// responses.
    history_batches: AtomicU64,
    /// Per-chat guards making backfill single-flight; concurrent calls for
    /// the same chat queue on the mutex.
    backfill_guards: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// A running ingest task. Dropping the handle does not stop it; use
/// [`SyncHandle::stop`].
pub struct SyncHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(err) = self.task.await {
            if err.is_panic() {
                tracing::error!("ingest task panicked during shutdown");
            }
        }
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        client: Arc<dyn WaClient>,
        state: Arc<StateMachine>,
        webhook: Arc<Emitter>,
        handlers: SharedHandlers,
        auto_download: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            state,
            webhook,
            handlers,
            auto_download,
            history_batches: AtomicU64::new(0),
            backfill_guards: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to the client and spawn the ingest task.
    pub fn spawn(self: &Arc<Self>) -> SyncHandle {
        let events = self.client.events();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let engine = self.clone();
        let task = tokio::spawn(async move {
            engine.run(events, cancel_rx).await;
        });
        SyncHandle {
            cancel: cancel_tx,
            task,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<WaEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        tracing::info!("sync engine started");
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "ingest lagged behind event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event stream closed");
                        break;
                    }
                },
            }
        }
        tracing::info!("sync engine stopped");
    }

    async fn handle_event(&self, event: WaEvent) {
        match event {
            WaEvent::Message(envelope) => {
                if let Some(msg) = parse::parse_live(&envelope) {
                    self.ingest(msg, true).await;
                }
            }
            WaEvent::HistorySync(batch) => {
                self.history_batches.fetch_add(1, Ordering::SeqCst);
                let mut stored = 0usize;
                for conv in &batch.conversations {
                    let chat = match Addr::parse(&conv.chat) {
                        Ok(chat) => chat,
                        Err(err) => {
                            tracing::debug!(chat = %conv.chat, error = %err, "skipping history conversation");
                            continue;
                        }
                    };
                    for envelope in &conv.messages {
                        if let Some(msg) = parse::parse_history(&chat, envelope) {
                            self.ingest(msg, false).await;
                            stored += 1;
                        }
                    }
                }
                tracing::info!(
                    conversations = batch.conversations.len(),
                    stored,
                    "processed history sync"
                );
            }
            WaEvent::Connected => self.state.set_state(State::Connected),
            WaEvent::Disconnected => self.state.set_state(State::Disconnected),
            WaEvent::PairSuccess { device } => {
                tracing::info!(device = %device, "pair success");
            }
            WaEvent::PairError { reason } => {
                tracing::warn!(reason = %reason, "pair error");
            }
            WaEvent::ContactsPush(contacts) => {
                for c in &contacts {
                    let addr = c.address.base().to_string();
                    if let Err(err) = self.store.upsert_contact(
                        &addr,
                        c.address.base().local(),
                        &c.push_name,
                        &c.full_name,
                        &c.first_name,
                        &c.business_name,
                    ) {
                        tracing::warn!(contact = %addr, error = %err, "contact push upsert failed");
                    }
                }
            }
            WaEvent::GroupsPush(groups) => {
                for g in &groups {
                    if let Err(err) = crate::manager::store_group_snapshot(&self.store, g) {
                        tracing::warn!(group = %g.address, error = %err, "group push upsert failed");
                    }
                }
            }
        }
    }

    /// The upsert chain for one parsed message. `fanout` is true only for
    /// live messages.
    async fn ingest(&self, mut msg: Message, fanout: bool) {
        // Best-effort name resolution; an upstream failure leaves the name
        // empty and the row still lands.
        let chat_name = self
            .client
            .resolve_chat_name(&msg.chat, &msg.sender_name)
            .await;
        msg.chat_name = chat_name;

        let chat_key = msg.chat.to_string();
        if let Err(err) =
            self.store
                .upsert_chat(&chat_key, msg.chat.kind(), &msg.chat_name, msg.ts)
        {
            tracing::error!(chat = %chat_key, error = %err, "chat upsert failed, dropping event");
            return;
        }
        if let Err(err) = self.store.upsert_message(&msg) {
            tracing::error!(chat = %chat_key, msg = %msg.id, error = %err, "message upsert failed, dropping event");
            return;
        }

        if fanout {
            self.dispatch(&msg);

            let downloadable = msg
                .media
                .as_ref()
                .map(|m| m.downloadable())
                .unwrap_or(false);
            if self.auto_download && downloadable {
                let store = self.store.clone();
                let client = self.client.clone();
                let msg_id = msg.id.clone();
                tokio::spawn(async move {
                    match crate::manager::perform_download(&store, &client, &chat_key, &msg_id)
                        .await
                    {
                        Ok(result) => {
                            tracing::debug!(msg = %msg_id, path = %result.local_path, "media auto-downloaded");
                        }
                        Err(err) => {
                            tracing::warn!(msg = %msg_id, error = %err, "media auto-download failed");
                        }
                    }
                });
            }
        }
    }

    /// Store commit has happened; tell the world. Each registered callback
    /// gets its own task per message.
    fn dispatch(&self, msg: &Message) {
        let media = msg.media.as_ref();
        let payload = ReceivedMessage {
            chat_jid: msg.chat.to_string(),
            chat_name: msg.chat_name.clone(),
            msg_id: msg.id.clone(),
            sender_jid: msg.sender.clone(),
            sender_name: msg.sender_name.clone(),
            timestamp: msg.ts,
            from_me: msg.from_me,
            text: msg.text.clone(),
            media_type: media
                .and_then(|m| m.kind)
                .map(|k| k.as_str().to_string())
                .unwrap_or_default(),
            caption: media.map(|m| m.caption.clone()).unwrap_or_default(),
        };

        self.webhook.emit("message.received", &payload);

        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        for handler in handlers.iter() {
            let handler = handler.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                handler(payload);
            });
        }
    }

    /// Ask the primary device for older history, `requests` times, waiting up
    /// to `wait` per request for the resulting sync to be ingested.
    pub async fn backfill(
        &self,
        chat: &Addr,
        count: u32,
        requests: u32,
        wait: Duration,
    ) -> ServiceResult<BackfillResult> {
        let chat_key = chat.base().to_string();
        let guard = {
            let mut guards = self
                .backfill_guards
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guards
                .entry(chat_key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _flight = guard.lock().await;

        let count = if count == 0 { 50 } else { count };
        let requests = if requests == 0 { 1 } else { requests };
        let wait = if wait.is_zero() {
            Duration::from_secs(60)
        } else {
            wait
        };

        let mut result = BackfillResult {
            chat: chat_key.clone(),
            requests_sent: 0,
            responses_seen: 0,
            messages_added: 0,
        };

        for _ in 0..requests {
            let Some(oldest) = self.store.oldest_message(&chat_key)? else {
                tracing::info!(chat = %chat_key, "no stored message to anchor backfill");
                break;
            };
            let anchor = HistoryAnchor {
                message_id: oldest.id,
                ts: oldest.ts,
                from_me: oldest.from_me,
                sender: oldest.sender,
            };

            let batches_before = self.history_batches.load(Ordering::SeqCst);
            let count_before = self.store.count_messages_in_chat(&chat_key)?;

            self.client
                .request_history(chat, &anchor, count)
                .await
                .map_err(ServiceError::from)?;
            result.requests_sent += 1;

            let deadline = tokio::time::Instant::now() + wait;
            let mut seen = false;
            while tokio::time::Instant::now() < deadline {
                if self.history_batches.load(Ordering::SeqCst) > batches_before {
                    seen = true;
                    // Give the ingest loop a moment to finish the batch.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if seen {
                result.responses_seen += 1;
            }

            let count_after = self.store.count_messages_in_chat(&chat_key)?;
            result.messages_added += count_after - count_before;
        }

        tracing::info!(
            chat = %chat_key,
            requests = result.requests_sent,
            responses = result.responses_seen,
            added = result.messages_added,
            "backfill finished"
        );
        Ok(result)
    }
}
