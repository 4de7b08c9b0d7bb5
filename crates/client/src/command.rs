//! Commands processed by the engine actor, from handles and from the
//! engine's own background tasks.

use tokio::sync::oneshot;

use crate::actions::Action;
use crate::error::TransportError;
use crate::store::SessionObserver;
use crate::transport::Connection;

/// A connection that opened and answered the liveness ping.
pub struct Established {
    pub conn: Connection,
    /// Text frames that arrived before the pong.
    pub early: Vec<String>,
}

pub enum EngineCommand {
    // -- Queries (use oneshot reply channels) --
    Observe {
        session_id: String,
        reply: oneshot::Sender<SessionObserver>,
    },

    // -- Consumer requests (fire-and-forget) --
    Subscribe {
        session_id: String,
    },
    Unsubscribe {
        session_id: String,
    },
    Action(Action),
    Restart,
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    // -- Background task reports --
    ConnectResult {
        generation: u64,
        result: Result<Established, TransportError>,
    },
    Inbound {
        generation: u64,
        text: String,
    },
    ReceiveFailed {
        generation: u64,
    },
    /// Backoff timer fired.
    Reconnect,
    /// Delayed approval-history re-read for one session.
    RefreshApprovals {
        session_id: String,
    },
}

impl EngineCommand {
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::Observe { .. } => "observe",
            EngineCommand::Subscribe { .. } => "subscribe",
            EngineCommand::Unsubscribe { .. } => "unsubscribe",
            EngineCommand::Action(_) => "action",
            EngineCommand::Restart => "restart",
            EngineCommand::Shutdown { .. } => "shutdown",
            EngineCommand::ConnectResult { .. } => "connect_result",
            EngineCommand::Inbound { .. } => "inbound",
            EngineCommand::ReceiveFailed { .. } => "receive_failed",
            EngineCommand::Reconnect => "reconnect",
            EngineCommand::RefreshApprovals { .. } => "refresh_approvals",
        }
    }
}
