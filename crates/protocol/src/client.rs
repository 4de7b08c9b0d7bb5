//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::{ApprovalDecision, Provider};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    SubscribeSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_revision: Option<u64>,
    },
    UnsubscribeSession {
        session_id: String,
    },
    SubscribeList,

    // Actions
    SendMessage {
        session_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        effort: Option<String>,
    },
    ApproveTool {
        session_id: String,
        request_id: String,
        decision: ApprovalDecision,
    },
    AnswerQuestion {
        session_id: String,
        request_id: String,
        answer: String,
    },
    InterruptSession {
        session_id: String,
    },
    EndSession {
        session_id: String,
    },

    // Session config
    UpdateSessionConfig {
        session_id: String,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    },

    // Session naming
    RenameSession {
        session_id: String,
        name: Option<String>,
    },

    // Session management
    CreateSession {
        provider: Provider,
        cwd: String,
        model: Option<String>,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    },
    ForkSession {
        source_session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        nth_user_message: Option<u32>,
    },

    // Approval history
    ListApprovals {
        session_id: Option<String>,
        limit: Option<u32>,
    },
    DeleteApproval {
        approval_id: i64,
    },

    // Codex models
    ListModels,

    // Context management
    CompactContext {
        session_id: String,
    },
    UndoLastTurn {
        session_id: String,
    },
}

impl ClientMessage {
    /// Session this command targets, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::SubscribeSession { session_id, .. }
            | ClientMessage::UnsubscribeSession { session_id }
            | ClientMessage::SendMessage { session_id, .. }
            | ClientMessage::ApproveTool { session_id, .. }
            | ClientMessage::AnswerQuestion { session_id, .. }
            | ClientMessage::InterruptSession { session_id }
            | ClientMessage::EndSession { session_id }
            | ClientMessage::UpdateSessionConfig { session_id, .. }
            | ClientMessage::RenameSession { session_id, .. }
            | ClientMessage::CompactContext { session_id }
            | ClientMessage::UndoLastTurn { session_id } => Some(session_id),
            ClientMessage::ForkSession {
                source_session_id, ..
            } => Some(source_session_id),
            ClientMessage::ListApprovals { session_id, .. } => session_id.as_deref(),
            ClientMessage::SubscribeList
            | ClientMessage::CreateSession { .. }
            | ClientMessage::DeleteApproval { .. }
            | ClientMessage::ListModels => None,
        }
    }
}
