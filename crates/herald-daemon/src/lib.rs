//! herald daemon core.
//!
//! Wires the pieces together: the state machine, the data directory lock,
//! the store, one protocol client, the sync engine, and the webhook emitter.
//! The HTTP surface and CLI that drive a deployment consume [`Manager`].

pub mod config;
pub mod lock;
pub mod manager;
pub mod state;
pub mod sync;

pub use config::Config;
pub use lock::DataDirLock;
pub use manager::{
    ClientFactory, Diagnostics, DownloadMediaResult, HealthInfo, Manager, SendFileResult,
    SyncStatus,
};
pub use state::{State, StateMachine, StatusInfo};
pub use sync::{BackfillResult, SyncEngine};
