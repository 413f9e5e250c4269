//! Outbound webhook delivery.
//!
//! A bounded queue feeds a fixed pool of workers. Enqueueing never blocks the
//! caller: when the queue is full the event is dropped and logged, making the
//! emitter at-most-once. Each worker serialises an event exactly once, POSTs
//! it, and retries transient failures with bounded exponential backoff before
//! giving up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

type HmacSha256 = Hmac<Sha256>;

/// Webhook signature header. The value is `sha256=<hex HMAC-SHA256>` over
/// exactly the bytes of the request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: String::new(),
            max_retries: 3,
            request_timeout: Duration::from_secs(10),
            queue_capacity: 1000,
            workers: 4,
        }
    }
}

/// The envelope every delivery carries.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

pub struct Emitter {
    config: Arc<WebhookConfig>,
    client: reqwest::Client,
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    workers: Mutex<JoinSet<()>>,
    dropped: AtomicU64,
}

impl Emitter {
    /// Build the emitter and start its worker pool.
    pub fn start(mut config: WebhookConfig) -> Arc<Self> {
        if config.workers == 0 {
            config.workers = 1;
        }
        if config.queue_capacity == 0 {
            config.queue_capacity = 1;
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel::<Event>(config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let config = Arc::new(config);

        let emitter = Arc::new(Self {
            config: config.clone(),
            client,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(JoinSet::new()),
            dropped: AtomicU64::new(0),
        });

        if emitter.is_configured() {
            let mut workers = emitter.workers.lock().unwrap_or_else(|e| e.into_inner());
            for n in 0..config.workers {
                let rx = rx.clone();
                let config = config.clone();
                let client = emitter.client.clone();
                workers.spawn(async move {
                    loop {
                        let event = { rx.lock().await.recv().await };
                        match event {
                            Some(event) => deliver(&client, &config, event).await,
                            None => break,
                        }
                    }
                    tracing::debug!(worker = n, "webhook worker drained");
                });
            }
            tracing::info!(workers = config.workers, url = %config.url, "webhook emitter started");
        }

        emitter
    }

    pub fn is_configured(&self) -> bool {
        !self.config.url.is_empty()
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue an event for delivery. Never blocks: returns false when the
    /// emitter is unconfigured, stopped, or at capacity (the event is
    /// dropped).
    pub fn emit<T: Serialize>(&self, event_type: &str, data: &T) -> bool {
        if !self.is_configured() {
            return false;
        }
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, event_type, "failed to serialise webhook data");
                return false;
            }
        };
        let event = Event {
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            data,
        };

        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event_type, "webhook queue full, dropping event");
                false
            }
        }
    }

    /// Stop accepting events and let the workers drain the queue, waiting up
    /// to `grace`. Workers still running after the grace period are aborted
    /// and their in-flight events are lost.
    pub async fn stop(&self, grace: Duration) {
        {
            let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            tx.take();
        }
        let mut workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        if workers.is_empty() {
            return;
        }

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("webhook drain exceeded grace period, aborting workers");
        }
        // A timed-out drain leaves tasks in the set; dropping it aborts them.
        tracing::info!("webhook emitter stopped");
    }
}

/// Deliver one event: serialise once, then attempt with backoff.
async fn deliver(client: &reqwest::Client, config: &WebhookConfig, event: Event) {
    let body = match serde_json::to_vec(&event) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(error = %err, "failed to marshal webhook event");
            return;
        }
    };

    let attempts = config.max_retries + 1;
    for attempt in 1..=attempts {
        if attempt > 1 {
            // 1s, 2s, 4s, ... capped at 30s.
            let backoff =
                Duration::from_secs(1u64 << (attempt - 2).min(5)).min(Duration::from_secs(30));
            tokio::time::sleep(backoff).await;
        }

        match send(client, config, &body).await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(
                        event_type = %event.event_type,
                        attempt,
                        "webhook delivered after retry"
                    );
                }
                return;
            }
            Err(err) => {
                tracing::warn!(
                    event_type = %event.event_type,
                    attempt,
                    error = %err,
                    "webhook delivery attempt failed"
                );
            }
        }
    }
    tracing::error!(
        event_type = %event.event_type,
        attempts,
        "webhook event dropped after exhausting retries"
    );
}

async fn send(client: &reqwest::Client, config: &WebhookConfig, body: &[u8]) -> Result<(), String> {
    let mut req = client
        .post(&config.url)
        .header("Content-Type", "application/json")
        .header("User-Agent", "herald-webhook/1.0");

    if !config.secret.is_empty() {
        req = req.header(SIGNATURE_HEADER, sign(body, &config.secret));
    }

    let resp = req
        .body(body.to_vec())
        .send()
        .await
        .map_err(|e| format!("send request: {e}"))?;

    if !resp.status().is_success() {
        return Err(format!("unexpected status: {}", resp.status()));
    }
    Ok(())
}

/// `sha256=<hex>` HMAC-SHA256 signature over the payload.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature against a payload.
pub fn verify(payload: &[u8], secret: &str, header: &str) -> bool {
    sign(payload, secret) == header
}
