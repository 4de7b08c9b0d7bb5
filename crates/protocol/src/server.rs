//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state sync
    SessionsList {
        sessions: Vec<SessionSummary>,
    },
    SessionSnapshot {
        session: SessionState,
    },

    // Incremental updates
    SessionDelta {
        session_id: String,
        changes: StateChanges,
    },
    MessageAppended {
        session_id: String,
        message: Message,
    },
    MessageUpdated {
        session_id: String,
        message_id: String,
        changes: MessageChanges,
    },
    ApprovalRequested {
        session_id: String,
        request: ApprovalRequest,
    },
    TokensUpdated {
        session_id: String,
        usage: TokenUsage,
    },

    // Lifecycle
    SessionCreated {
        session: SessionSummary,
    },
    SessionEnded {
        session_id: String,
        reason: String,
    },
    SessionForked {
        source_session_id: String,
        new_session_id: String,
    },

    // Approval history
    ApprovalsList {
        session_id: Option<String>,
        approvals: Vec<ApprovalHistoryItem>,
    },
    ApprovalDeleted {
        approval_id: i64,
    },

    // Codex models
    ModelsList {
        models: Vec<CodexModelOption>,
    },

    // Skills
    SkillsList {
        session_id: String,
        skills: Vec<SkillsListEntry>,
        #[serde(default)]
        errors: Vec<SkillErrorInfo>,
    },

    // Context management
    ContextCompacted {
        session_id: String,
    },
    UndoCompleted {
        session_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ThreadRolledBack {
        session_id: String,
        num_turns: u32,
    },

    // Errors
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },
}

impl ServerMessage {
    /// Session this message belongs to, if it is session-scoped.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionSnapshot { session } => Some(&session.id),
            ServerMessage::SessionCreated { session } => Some(&session.id),
            ServerMessage::SessionDelta { session_id, .. }
            | ServerMessage::MessageAppended { session_id, .. }
            | ServerMessage::MessageUpdated { session_id, .. }
            | ServerMessage::ApprovalRequested { session_id, .. }
            | ServerMessage::TokensUpdated { session_id, .. }
            | ServerMessage::SessionEnded { session_id, .. }
            | ServerMessage::SkillsList { session_id, .. }
            | ServerMessage::ContextCompacted { session_id }
            | ServerMessage::UndoCompleted { session_id, .. }
            | ServerMessage::ThreadRolledBack { session_id, .. } => Some(session_id),
            ServerMessage::SessionForked {
                source_session_id, ..
            } => Some(source_session_id),
            ServerMessage::ApprovalsList { session_id, .. }
            | ServerMessage::Error { session_id, .. } => session_id.as_deref(),
            ServerMessage::SessionsList { .. }
            | ServerMessage::ApprovalDeleted { .. }
            | ServerMessage::ModelsList { .. } => None,
        }
    }
}
