//! OrbitDock Protocol
//!
//! Wire types spoken between the OrbitDock server and the client sync engine.
//! These types are serialized as JSON over WebSocket.

// Re-exports
pub mod client;
pub mod patch;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use patch::Patch;
pub use server::ServerMessage;
pub use types::*;
