//! OrbitDock client sync engine.
//!
//! Keeps a local mirror of server-side session state over one WebSocket:
//! snapshots and deltas from the server are reconciled into a store that
//! observers read lock-free, while user actions are applied optimistically
//! and reconciled once the server's persisted state comes back.

pub mod actions;
pub mod approvals;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod logging;
pub mod messages;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod supervisor;
pub mod transport;

pub use actions::Action;
pub use config::{DataPaths, SyncConfig};
pub use dispatch::EngineEvent;
pub use engine::{EngineHandle, SyncEngine};
pub use error::{ConfigError, EngineError, HealthError, TransportError};
pub use logging::{LogFormat, LogSettings};
pub use store::{SessionObserver, SessionRecord};
pub use supervisor::{ConnectionState, ReconnectPolicy};
pub use transport::{Transport, WsTransport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
