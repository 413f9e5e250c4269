//! Connection state machine.
//!
//! One enum behind a read-write lock replaces the pile of booleans a client
//! like this tends to grow. Reads take the read lock, transitions take the
//! write lock, and listener callbacks always run outside either.

use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Disconnected,
    Connecting,
    Pairing,
    Connected,
    Unauthenticated,
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Disconnected => "disconnected",
            State::Connecting => "connecting",
            State::Pairing => "pairing",
            State::Connected => "connected",
            State::Unauthenticated => "unauthenticated",
            State::Error => "error",
        }
    }

    /// Send-style operations are accepted only when connected.
    pub fn is_ready(&self) -> bool {
        *self == State::Connected
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status snapshot handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub state: State,
    pub ready: bool,
    pub has_qr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Inner {
    state: State,
    last_error: Option<String>,
    qr_code: String,
}

type Listener = Box<dyn Fn(State, State) + Send + Sync>;

pub struct StateMachine {
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<Listener>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: State::Unauthenticated,
                last_error: None,
                qr_code: String::new(),
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> State {
        self.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Transition to a new state. Entering anything but `Pairing` clears the
    /// QR payload; entering anything but `Error` clears the stored error.
    pub fn set_state(&self, new: State) {
        let old = {
            let mut inner = self.write();
            let old = inner.state;
            inner.state = new;
            if new != State::Pairing {
                inner.qr_code.clear();
            }
            if new != State::Error {
                inner.last_error = None;
            }
            old
        };
        if old != new {
            tracing::debug!(from = %old, to = %new, "state transition");
            self.notify(old, new);
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let old = {
            let mut inner = self.write();
            let old = inner.state;
            inner.state = State::Error;
            inner.last_error = Some(message.clone());
            inner.qr_code.clear();
            old
        };
        tracing::warn!(error = %message, "entering error state");
        if old != State::Error {
            self.notify(old, State::Error);
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.read().last_error.clone()
    }

    /// Store a fresh QR payload, replacing any prior one, and move to
    /// `Pairing`.
    pub fn set_qr(&self, code: impl Into<String>) {
        let old = {
            let mut inner = self.write();
            let old = inner.state;
            inner.qr_code = code.into();
            inner.state = State::Pairing;
            old
        };
        if old != State::Pairing {
            self.notify(old, State::Pairing);
        }
    }

    /// The current QR payload; empty unless pairing is in progress.
    pub fn qr(&self) -> String {
        let inner = self.read();
        if inner.state == State::Pairing {
            inner.qr_code.clone()
        } else {
            String::new()
        }
    }

    pub fn clear_qr(&self) {
        self.write().qr_code.clear();
    }

    /// Register a transition listener. Callbacks run outside the state lock
    /// and must not block for long.
    pub fn on_change(&self, listener: impl Fn(State, State) + Send + Sync + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }

    pub fn status(&self) -> StatusInfo {
        let inner = self.read();
        StatusInfo {
            state: inner.state,
            ready: inner.state.is_ready(),
            has_qr: !inner.qr_code.is_empty(),
            error: inner.last_error.clone(),
        }
    }

    fn notify(&self, old: State, new: State) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(old, new);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn starts_unauthenticated() {
        let sm = StateMachine::new();
        assert_eq!(sm.state(), State::Unauthenticated);
        assert!(!sm.is_ready());
    }

    #[test]
    fn only_connected_is_ready() {
        let sm = StateMachine::new();
        for state in [
            State::Disconnected,
            State::Connecting,
            State::Pairing,
            State::Unauthenticated,
            State::Error,
        ] {
            sm.set_state(state);
            assert!(!sm.is_ready(), "{state} must not be ready");
        }
        sm.set_state(State::Connected);
        assert!(sm.is_ready());
    }

    #[test]
    fn qr_visible_only_while_pairing() {
        let sm = StateMachine::new();
        sm.set_qr("2@abc,def");
        assert_eq!(sm.state(), State::Pairing);
        assert_eq!(sm.qr(), "2@abc,def");

        // A rotated QR replaces the prior payload.
        sm.set_qr("2@ghi,jkl");
        assert_eq!(sm.qr(), "2@ghi,jkl");

        sm.set_state(State::Connected);
        assert_eq!(sm.qr(), "");
        assert!(!sm.status().has_qr);
    }

    #[test]
    fn error_state_keeps_message_until_left() {
        let sm = StateMachine::new();
        sm.set_error("pairing failed: timeout");
        assert_eq!(sm.state(), State::Error);
        assert_eq!(sm.last_error().as_deref(), Some("pairing failed: timeout"));

        sm.set_state(State::Connecting);
        assert!(sm.last_error().is_none());
    }

    #[test]
    fn listeners_fire_on_real_transitions_only() {
        let sm = StateMachine::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        sm.on_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sm.set_state(State::Connecting);
        sm.set_state(State::Connecting);
        sm.set_state(State::Connected);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
