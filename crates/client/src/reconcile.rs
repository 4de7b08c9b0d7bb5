//! Server message → local state.
//!
//! `reconcile` is pure and synchronous: it mutates the store and registry it
//! is handed and returns the effects the engine must carry out (sends,
//! delayed refreshes, surfaced events, task cancellation). No I/O here.

use std::collections::HashSet;

use orbitdock_protocol::{
    ApprovalType, ClientMessage, MessageChanges, Patch, ServerMessage, SessionState,
    SessionStatus, StateChanges, WorkStatus,
};
use tracing::{debug, info, warn};

use crate::approvals;
use crate::dispatch::EngineEvent;
use crate::messages::{self, UpsertOutcome};
use crate::store::{SessionRecord, SessionStore};
use crate::subscriptions::SubscriptionRegistry;

#[derive(Debug, Clone)]
pub enum Effect {
    Send(ClientMessage),
    /// Fetch the session's approval history now; with `follow_up`, again
    /// after each configured delay.
    RefreshApprovals {
        session_id: String,
        follow_up: bool,
    },
    Surface(EngineEvent),
    /// Abort any background work scoped to a session that no longer exists.
    CancelSession(String),
}

pub fn reconcile(
    store: &mut SessionStore,
    registry: &mut SubscriptionRegistry,
    message: &ServerMessage,
    now: &str,
) -> Vec<Effect> {
    let mut effects = Vec::new();

    match message {
        // -- Full state ---------------------------------------------------
        ServerMessage::SessionSnapshot { session } => {
            apply_snapshot(store.get_or_create(&session.id), session);
            if let Some(revision) = session.revision {
                registry.reset_revision(&session.id, revision);
            }
            debug!(
                component = "reconcile",
                event = "reconcile.snapshot",
                session_id = %session.id,
                messages = session.messages.len(),
                revision = ?session.revision,
            );
        }

        ServerMessage::SessionsList { sessions } => {
            let listed: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
            for summary in sessions {
                store.get_or_create(&summary.id).apply_summary(summary);
            }
            let order: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
            store.set_order(&order);

            let gone: Vec<String> = store
                .ids()
                .filter(|id| !listed.contains(id))
                .map(str::to_owned)
                .collect();
            for id in gone {
                store.remove(&id);
                registry.forget(&id);
                info!(
                    component = "reconcile",
                    event = "reconcile.session.removed",
                    session_id = %id,
                    "Session no longer listed by server"
                );
                effects.push(Effect::CancelSession(id));
            }
        }

        // -- Incremental ----------------------------------------------------
        ServerMessage::SessionDelta {
            session_id,
            changes,
        } => {
            let record = store.get_or_create(session_id);
            let previous_request = record.pending_approval.as_ref().map(|r| r.id.clone());
            apply_delta(record, changes.clone());
            let current_request = record.pending_approval.as_ref().map(|r| r.id.clone());

            match (previous_request, current_request) {
                (Some(_), None) => effects.push(Effect::RefreshApprovals {
                    session_id: session_id.clone(),
                    follow_up: true,
                }),
                (previous, Some(current)) if previous.as_deref() != Some(current.as_str()) => {
                    effects.push(Effect::RefreshApprovals {
                        session_id: session_id.clone(),
                        follow_up: false,
                    })
                }
                _ => {}
            }
        }

        ServerMessage::MessageAppended {
            session_id,
            message,
        } => {
            let record = store.get_or_create(session_id);
            let outcome = messages::upsert_appended(
                &mut record.messages,
                &record.finalized_messages,
                message.clone(),
            );
            record.message_revision += 1;
            if outcome == UpsertOutcome::Merged {
                debug!(
                    component = "reconcile",
                    event = "reconcile.message.merged",
                    session_id = %session_id,
                    message_id = %message.id,
                );
            }
        }

        ServerMessage::MessageUpdated {
            session_id,
            message_id,
            changes,
        } => {
            apply_message_update(store.get_or_create(session_id), message_id, changes, now);
        }

        ServerMessage::ApprovalRequested {
            session_id,
            request,
        } => {
            let record = store.get_or_create(session_id);
            record.work_status = match request.approval_type {
                ApprovalType::Question => WorkStatus::Question,
                ApprovalType::Exec | ApprovalType::Patch => WorkStatus::Permission,
            };
            record.set_pending_approval(Some(request.clone()));
            effects.push(Effect::RefreshApprovals {
                session_id: session_id.clone(),
                follow_up: false,
            });
        }

        ServerMessage::TokensUpdated { session_id, usage } => {
            store.get_or_create(session_id).token_usage = usage.clone();
        }

        // -- Lifecycle ------------------------------------------------------
        ServerMessage::SessionCreated { session } => {
            store.get_or_create(&session.id).apply_summary(session);
        }

        ServerMessage::SessionEnded { session_id, reason } => {
            if let Some(record) = store.get_mut(session_id) {
                record.status = SessionStatus::Ended;
                record.work_status = WorkStatus::Ended;
                record.set_pending_approval(None);
                info!(
                    component = "reconcile",
                    event = "reconcile.session.ended",
                    session_id = %session_id,
                    reason = %reason,
                    "Session ended"
                );
            }
        }

        ServerMessage::SessionForked {
            source_session_id,
            new_session_id,
        } => {
            if let Some(source) = store.get_mut(source_session_id) {
                source.fork_in_progress = false;
            }
            store.get_or_create(new_session_id).forked_from_session_id =
                Some(source_session_id.clone());
        }

        // -- Approval history ---------------------------------------------
        ServerMessage::ApprovalsList {
            session_id: Some(session_id),
            approvals,
        } => {
            // A page for a session we already dropped is stale.
            if let Some(record) = store.get_mut(session_id) {
                record.approval_history =
                    approvals::merge_history(&record.approval_history, approvals.clone());
            }
        }

        ServerMessage::ApprovalsList {
            session_id: None,
            approvals,
        } => {
            let global = store.global_approvals_mut();
            *global = approvals::merge_history(global, approvals.clone());
        }

        ServerMessage::ApprovalDeleted { approval_id } => {
            let holders: Vec<String> = store
                .ids()
                .filter(|id| {
                    store.get(id).is_some_and(|r| {
                        r.approval_history.iter().any(|a| a.id == *approval_id)
                    })
                })
                .map(str::to_owned)
                .collect();
            for id in holders {
                if let Some(record) = store.get_mut(&id) {
                    approvals::remove(&mut record.approval_history, *approval_id);
                }
            }
            if store.global_approvals().iter().any(|a| a.id == *approval_id) {
                approvals::remove(store.global_approvals_mut(), *approval_id);
            }
        }

        ServerMessage::ModelsList { models } => {
            store.set_models(models.clone());
        }

        // -- Errors ---------------------------------------------------------
        ServerMessage::Error {
            code,
            message,
            session_id,
        } => {
            warn!(
                component = "reconcile",
                event = "reconcile.server_error",
                code = %code,
                session_id = ?session_id,
                error = %message,
                "Server reported an error"
            );
            match (code.as_str(), session_id.as_deref()) {
                ("lagged", Some(id)) => {
                    let resubscribe = registry.lagged(id);
                    if !resubscribe.is_empty() {
                        effects.extend(resubscribe.into_iter().map(Effect::Send));
                        effects.push(Effect::RefreshApprovals {
                            session_id: id.to_string(),
                            follow_up: false,
                        });
                    }
                }
                ("fork_failed" | "not_found", Some(id)) => {
                    if store.get(id).is_some_and(|r| r.fork_in_progress) {
                        if let Some(record) = store.get_mut(id) {
                            record.fork_in_progress = false;
                        }
                    }
                }
                _ => {}
            }
            effects.push(Effect::Surface(EngineEvent::ServerError {
                code: code.clone(),
                message: message.clone(),
                session_id: session_id.clone(),
            }));
        }

        // Observers see these through the event bus; nothing to mirror.
        ServerMessage::SkillsList { .. }
        | ServerMessage::ContextCompacted { .. }
        | ServerMessage::UndoCompleted { .. }
        | ServerMessage::ThreadRolledBack { .. } => {}
    }

    effects
}

fn apply_snapshot(record: &mut SessionRecord, session: &SessionState) {
    record.provider = Some(session.provider);
    record.project_path = session.project_path.clone();
    record.project_name = session.project_name.clone();
    record.model = session.model.clone();
    record.custom_name = session.custom_name.clone();
    record.status = session.status;
    record.work_status = session.work_status;
    record.messages = messages::dedupe(session.messages.clone());
    record.finalized_messages.clear();
    record.set_pending_approval(session.pending_approval.clone());
    record.token_usage = session.token_usage.clone();
    record.current_diff = session.current_diff.clone();
    record.current_plan = session.current_plan.clone();
    record.codex_integration_mode = session.codex_integration_mode;
    record.approval_policy = session.approval_policy.clone();
    record.sandbox_mode = session.sandbox_mode.clone();
    if session.forked_from_session_id.is_some() {
        record.forked_from_session_id = session.forked_from_session_id.clone();
    }
    record.started_at = session.started_at.clone();
    record.last_activity_at = session.last_activity_at.clone();
    record.message_revision += 1;
    record.has_snapshot = true;
}

fn apply_delta(record: &mut SessionRecord, changes: StateChanges) {
    if let Some(status) = changes.status {
        record.status = status;
    }
    if let Some(work_status) = changes.work_status {
        record.work_status = work_status;
    }
    if let Some(usage) = changes.token_usage {
        record.token_usage = usage;
    }
    if let Some(at) = changes.last_activity_at {
        record.last_activity_at = Some(at);
    }

    match changes.pending_approval {
        Patch::Unchanged => {}
        Patch::Cleared => record.set_pending_approval(None),
        Patch::Set(request) => record.set_pending_approval(Some(request)),
    }
    changes.current_diff.apply_to(&mut record.current_diff);
    changes.current_plan.apply_to(&mut record.current_plan);
    changes.custom_name.apply_to(&mut record.custom_name);
    changes.model.apply_to(&mut record.model);
    changes
        .codex_integration_mode
        .apply_to(&mut record.codex_integration_mode);
    changes.approval_policy.apply_to(&mut record.approval_policy);
    changes.sandbox_mode.apply_to(&mut record.sandbox_mode);
}

fn apply_message_update(
    record: &mut SessionRecord,
    message_id: &str,
    changes: &MessageChanges,
    now: &str,
) {
    let session_id = record.id.clone();
    let outcome = messages::upsert_updated(
        &mut record.messages,
        &mut record.finalized_messages,
        &session_id,
        message_id,
        changes.clone(),
        now,
    );
    record.message_revision += 1;
    if outcome == UpsertOutcome::Placeholder {
        debug!(
            component = "reconcile",
            event = "reconcile.message.placeholder",
            session_id = %session_id,
            message_id = %message_id,
            "Update arrived before its message; created placeholder"
        );
    }
}
