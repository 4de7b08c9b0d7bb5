//! Inbound frame decoding and event fan-out.

use std::sync::Arc;

use orbitdock_protocol::ServerMessage;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::supervisor::ConnectionState;

const LOG_PREVIEW_CHARS: usize = 240;

/// Out-of-band replay cursor carried on some frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMarker {
    pub session_id: String,
    pub revision: u64,
}

#[derive(Debug, Default)]
pub struct Decoded {
    pub revision: Option<RevisionMarker>,
    pub message: Option<ServerMessage>,
}

/// Decode one text frame. Never fails: malformed frames are logged and
/// yield no message, but a readable revision marker is still returned.
pub fn decode_frame(text: &str) -> Decoded {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                component = "dispatch",
                event = "dispatch.frame.invalid_json",
                error = %e,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text, LOG_PREVIEW_CHARS),
                "Dropping frame that is not JSON"
            );
            return Decoded::default();
        }
    };

    let revision = extract_revision(&value);

    let message = match serde_json::from_value::<ServerMessage>(value) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(
                component = "dispatch",
                event = "dispatch.frame.decode_failed",
                error = %e,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text, LOG_PREVIEW_CHARS),
                "Dropping undecodable server message"
            );
            None
        }
    };

    if let Some(marker) = &revision {
        trace!(
            component = "dispatch",
            event = "dispatch.revision",
            session_id = %marker.session_id,
            revision = marker.revision,
        );
    }

    Decoded { revision, message }
}

fn extract_revision(value: &Value) -> Option<RevisionMarker> {
    let revision = value.get("revision")?.as_u64()?;
    let session_id = value.get("session_id")?.as_str()?;
    Some(RevisionMarker {
        session_id: session_id.to_string(),
        revision,
    })
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// What external observers see.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connection(ConnectionState),
    Server(Arc<ServerMessage>),
    ServerError {
        code: String,
        message: String,
        session_id: Option<String>,
    },
}

/// Broadcast fan-out to any number of observers. Publishing never blocks;
/// slow observers lag and lose events, the store stays authoritative.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
