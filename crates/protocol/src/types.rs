//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

use crate::patch::Patch;

/// AI provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Codex,
}

/// Codex integration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodexIntegrationMode {
    Direct,
    Passive,
}

/// Session status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Ended,
}

/// Work status - what the agent is currently doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Working,
    #[default]
    Waiting,
    Permission,
    Question,
    Reply,
    Ended,
}

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    Thinking,
    Tool,
    ToolResult,
    Steer,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub session_id: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<String>,
    #[serde(default)]
    pub tool_output: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_in_progress: bool,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub context_window: u64,
}

impl TokenUsage {
    /// Calculate context fill percentage
    pub fn context_fill_percent(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        (self.input_tokens as f64 / self.context_window as f64) * 100.0
    }

    /// Calculate cache hit percentage
    pub fn cache_hit_percent(&self) -> f64 {
        if self.input_tokens == 0 {
            return 0.0;
        }
        (self.cached_tokens as f64 / self.input_tokens as f64) * 100.0
    }
}

/// Approval request for tool execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub approval_type: ApprovalType,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_amendment: Option<Vec<String>>,
}

/// Type of approval being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Exec,
    Patch,
    Question,
}

/// Decision sent back for a pending tool approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    ApprovedForSession,
    ApprovedAlways,
    Denied,
    Abort,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::ApprovedForSession => "approved_for_session",
            ApprovalDecision::ApprovedAlways => "approved_always",
            ApprovalDecision::Denied => "denied",
            ApprovalDecision::Abort => "abort",
        }
    }

    /// Whether the agent keeps running tools after this decision.
    pub fn continues_work(&self) -> bool {
        matches!(
            self,
            ApprovalDecision::Approved
                | ApprovalDecision::ApprovedForSession
                | ApprovalDecision::ApprovedAlways
        )
    }
}

/// A persisted approval row (pending or decided)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalHistoryItem {
    pub id: i64,
    pub session_id: String,
    pub request_id: String,
    pub approval_type: ApprovalType,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_amendment: Option<Vec<String>>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub decided_at: Option<String>,
}

impl ApprovalHistoryItem {
    /// A row is resolved once either the decision or its timestamp is known.
    pub fn is_resolved(&self) -> bool {
        self.decision.is_some() || self.decided_at.is_some()
    }
}

/// Model option exposed by the Codex model catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodexModelOption {
    pub id: String,
    pub model: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub supported_reasoning_efforts: Vec<String>,
}

/// Skill discovered for a working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub path: String,
}

/// Skills grouped by working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillsListEntry {
    pub cwd: String,
    #[serde(default)]
    pub skills: Vec<SkillMetadata>,
}

/// A skill that failed to load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillErrorInfo {
    pub path: String,
    pub message: String,
}

/// Summary of a session for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub provider: Provider,
    pub project_path: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub status: SessionStatus,
    pub work_status: WorkStatus,
    #[serde(default)]
    pub has_pending_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_integration_mode: Option<CodexIntegrationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from_session_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub last_activity_at: Option<String>,
}

/// Full session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub provider: Provider,
    pub project_path: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub status: SessionStatus,
    pub work_status: WorkStatus,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pending_approval: Option<ApprovalRequest>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub current_diff: Option<String>,
    #[serde(default)]
    pub current_plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_integration_mode: Option<CodexIntegrationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from_session_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub last_activity_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

/// Changes to apply to a session state (delta updates)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_status: Option<WorkStatus>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub pending_approval: Patch<ApprovalRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub current_diff: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub current_plan: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub custom_name: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub model: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub codex_integration_mode: Patch<CodexIntegrationMode>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub approval_policy: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unchanged")]
    pub sandbox_mode: Patch<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<String>,
}

/// Changes to apply to a message (delta updates)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_progress: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_distinguishes_absent_null_and_value() {
        let json = r#"{
          "work_status":"permission",
          "pending_approval":null,
          "current_plan":"1. ship"
        }"#;
        let changes: StateChanges = serde_json::from_str(json).expect("parse delta");
        assert_eq!(changes.work_status, Some(WorkStatus::Permission));
        assert_eq!(changes.pending_approval, Patch::Cleared);
        assert_eq!(changes.current_plan, Patch::Set("1. ship".to_string()));
        assert_eq!(changes.current_diff, Patch::Unchanged);
        assert_eq!(changes.custom_name, Patch::Unchanged);
    }

    #[test]
    fn history_item_resolution_uses_decision_or_timestamp() {
        let mut item = ApprovalHistoryItem {
            id: 1,
            session_id: "s".into(),
            request_id: "0".into(),
            approval_type: ApprovalType::Exec,
            tool_name: None,
            command: Some("ls".into()),
            file_path: None,
            cwd: None,
            decision: None,
            proposed_amendment: None,
            created_at: "1Z".into(),
            decided_at: None,
        };
        assert!(!item.is_resolved());
        item.decided_at = Some("2Z".into());
        assert!(item.is_resolved());
        item.decided_at = None;
        item.decision = Some("denied".into());
        assert!(item.is_resolved());
    }

    #[test]
    fn approval_decision_wire_names() {
        let json = serde_json::to_string(&ApprovalDecision::ApprovedForSession).expect("ser");
        assert_eq!(json, r#""approved_for_session""#);
        assert_eq!(ApprovalDecision::Abort.as_str(), "abort");
        assert!(ApprovalDecision::ApprovedAlways.continues_work());
        assert!(!ApprovalDecision::Denied.continues_work());
    }

    #[test]
    fn token_usage_percentages() {
        let usage = TokenUsage {
            input_tokens: 50,
            output_tokens: 10,
            cached_tokens: 25,
            context_window: 200,
        };
        assert_eq!(usage.context_fill_percent(), 25.0);
        assert_eq!(usage.cache_hit_percent(), 50.0);
        assert_eq!(TokenUsage::default().context_fill_percent(), 0.0);
    }
}
