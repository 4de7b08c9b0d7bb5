//! User-initiated commands.
//!
//! Each action mutates the local mirror first so the UI reflects it at once,
//! then returns the command to send plus any follow-up refresh. The server's
//! answer later overwrites whatever we guessed.

use std::time::{SystemTime, UNIX_EPOCH};

use orbitdock_protocol::{ApprovalDecision, ClientMessage, Provider, WorkStatus};
use tracing::{debug, info};

use crate::approvals::{self, RequestShape};
use crate::reconcile::Effect;
use crate::store::SessionStore;

/// Decision recorded locally when a question is answered.
const ANSWERED: &str = "answered";

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Decide {
        session_id: String,
        request_id: String,
        decision: ApprovalDecision,
    },
    Answer {
        session_id: String,
        request_id: String,
        answer: String,
    },
    Rename {
        session_id: String,
        name: Option<String>,
    },
    UpdateConfig {
        session_id: String,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    },
    Fork {
        session_id: String,
        nth_user_message: Option<u32>,
    },
    DeleteApproval {
        approval_id: i64,
    },
    CreateSession {
        provider: Provider,
        cwd: String,
        model: Option<String>,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    },
    SendMessage {
        session_id: String,
        content: String,
        model: Option<String>,
        effort: Option<String>,
    },
    Interrupt {
        session_id: String,
    },
    End {
        session_id: String,
    },
    ListGlobalApprovals,
    ListModels,
    CompactContext {
        session_id: String,
    },
    UndoLastTurn {
        session_id: String,
    },
}

impl Action {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Action::Decide { session_id, .. }
            | Action::Answer { session_id, .. }
            | Action::Rename { session_id, .. }
            | Action::UpdateConfig { session_id, .. }
            | Action::Fork { session_id, .. }
            | Action::SendMessage { session_id, .. }
            | Action::Interrupt { session_id }
            | Action::End { session_id }
            | Action::CompactContext { session_id }
            | Action::UndoLastTurn { session_id } => Some(session_id),
            Action::DeleteApproval { .. }
            | Action::CreateSession { .. }
            | Action::ListGlobalApprovals
            | Action::ListModels => None,
        }
    }
}

pub fn apply(
    store: &mut SessionStore,
    action: Action,
    approval_page_limit: u32,
    now: &str,
) -> Vec<Effect> {
    match action {
        Action::Decide {
            session_id,
            request_id,
            decision,
        } => {
            let next_status = if decision.continues_work() {
                WorkStatus::Working
            } else {
                WorkStatus::Waiting
            };
            resolve(
                store,
                &session_id,
                &request_id,
                decision.as_str(),
                next_status,
                now,
            );
            vec![
                Effect::Send(ClientMessage::ApproveTool {
                    session_id: session_id.clone(),
                    request_id,
                    decision,
                }),
                Effect::RefreshApprovals {
                    session_id,
                    follow_up: true,
                },
            ]
        }

        Action::Answer {
            session_id,
            request_id,
            answer,
        } => {
            resolve(
                store,
                &session_id,
                &request_id,
                ANSWERED,
                WorkStatus::Working,
                now,
            );
            vec![
                Effect::Send(ClientMessage::AnswerQuestion {
                    session_id: session_id.clone(),
                    request_id,
                    answer,
                }),
                Effect::RefreshApprovals {
                    session_id,
                    follow_up: true,
                },
            ]
        }

        Action::Rename { session_id, name } => {
            let name = name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty());
            if let Some(record) = store.get_mut(&session_id) {
                record.custom_name = name.clone();
            }
            vec![Effect::Send(ClientMessage::RenameSession { session_id, name })]
        }

        Action::UpdateConfig {
            session_id,
            approval_policy,
            sandbox_mode,
        } => {
            if let Some(record) = store.get_mut(&session_id) {
                if approval_policy.is_some() {
                    record.approval_policy = approval_policy.clone();
                }
                if sandbox_mode.is_some() {
                    record.sandbox_mode = sandbox_mode.clone();
                }
            }
            vec![Effect::Send(ClientMessage::UpdateSessionConfig {
                session_id,
                approval_policy,
                sandbox_mode,
            })]
        }

        Action::Fork {
            session_id,
            nth_user_message,
        } => {
            if let Some(record) = store.get_mut(&session_id) {
                record.fork_in_progress = true;
            }
            info!(
                component = "actions",
                event = "actions.fork.requested",
                session_id = %session_id,
                nth_user_message = ?nth_user_message,
                "Fork requested"
            );
            vec![Effect::Send(ClientMessage::ForkSession {
                source_session_id: session_id,
                nth_user_message,
            })]
        }

        Action::DeleteApproval { approval_id } => {
            let holders: Vec<String> = store
                .ids()
                .filter(|id| {
                    store.get(id).is_some_and(|r| {
                        r.approval_history.iter().any(|a| a.id == approval_id)
                    })
                })
                .map(str::to_owned)
                .collect();
            for id in holders {
                if let Some(record) = store.get_mut(&id) {
                    approvals::remove(&mut record.approval_history, approval_id);
                }
            }
            approvals::remove(store.global_approvals_mut(), approval_id);
            vec![Effect::Send(ClientMessage::DeleteApproval { approval_id })]
        }

        Action::CreateSession {
            provider,
            cwd,
            model,
            approval_policy,
            sandbox_mode,
        } => vec![Effect::Send(ClientMessage::CreateSession {
            provider,
            cwd,
            model,
            approval_policy,
            sandbox_mode,
        })],

        Action::SendMessage {
            session_id,
            content,
            model,
            effort,
        } => vec![Effect::Send(ClientMessage::SendMessage {
            session_id,
            content,
            model,
            effort,
        })],

        Action::Interrupt { session_id } => {
            vec![Effect::Send(ClientMessage::InterruptSession { session_id })]
        }
        Action::End { session_id } => vec![Effect::Send(ClientMessage::EndSession { session_id })],
        Action::ListGlobalApprovals => vec![Effect::Send(ClientMessage::ListApprovals {
            session_id: None,
            limit: Some(approval_page_limit),
        })],
        Action::ListModels => vec![Effect::Send(ClientMessage::ListModels)],
        Action::CompactContext { session_id } => {
            vec![Effect::Send(ClientMessage::CompactContext { session_id })]
        }
        Action::UndoLastTurn { session_id } => {
            vec![Effect::Send(ClientMessage::UndoLastTurn { session_id })]
        }
    }
}

/// Clear the pending request and mark its history row decided in both the
/// session and global lists. A decision for anything but the pending request
/// leaves history to the follow-up refreshes, since a reused request id
/// alone cannot pick the right row.
fn resolve(
    store: &mut SessionStore,
    session_id: &str,
    request_id: &str,
    decision: &str,
    next_status: WorkStatus,
    now: &str,
) {
    let Some(record) = store.get_mut(session_id) else {
        return;
    };
    let shape = match record.pending_approval.as_ref() {
        Some(pending) if pending.id == request_id => RequestShape::from(pending),
        _ => {
            debug!(
                component = "actions",
                event = "actions.approval.not_pending",
                session_id = %session_id,
                request_id = %request_id,
                "Decision does not match the pending request, history left to refresh"
            );
            return;
        }
    };
    record.set_pending_approval(None);
    record.work_status = next_status;
    approvals::resolve_locally(
        &mut record.approval_history,
        session_id,
        request_id,
        &shape,
        decision,
        now,
    );
    approvals::resolve_locally(
        store.global_approvals_mut(),
        session_id,
        request_id,
        &shape,
        decision,
        now,
    );
    debug!(
        component = "actions",
        event = "actions.approval.resolved_locally",
        session_id = %session_id,
        request_id = %request_id,
        decision = %decision,
    );
}

/// Seconds since the epoch, `Z`-suffixed, for locally stamped rows.
pub fn chrono_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}
