//! Approval history lists: page merge and local resolution.

use std::collections::HashMap;

use orbitdock_protocol::{ApprovalHistoryItem, ApprovalRequest};

/// Merge a freshly fetched page over what we hold.
///
/// The page is authoritative for which rows exist, but a row we already
/// know to be resolved never regresses to pending: pages can be served
/// before the server has persisted a decision we applied locally.
pub fn merge_history(
    existing: &[ApprovalHistoryItem],
    incoming: Vec<ApprovalHistoryItem>,
) -> Vec<ApprovalHistoryItem> {
    let resolved: HashMap<i64, &ApprovalHistoryItem> = existing
        .iter()
        .filter(|item| item.is_resolved())
        .map(|item| (item.id, item))
        .collect();

    let mut merged: Vec<ApprovalHistoryItem> = incoming
        .into_iter()
        .map(|item| match resolved.get(&item.id) {
            Some(kept) if !item.is_resolved() => (*kept).clone(),
            _ => item,
        })
        .collect();
    sort_newest_first(&mut merged);
    merged.dedup_by_key(|item| item.id);
    merged
}

pub fn sort_newest_first(items: &mut [ApprovalHistoryItem]) {
    items.sort_by(|a, b| b.id.cmp(&a.id));
}

pub fn remove(items: &mut Vec<ApprovalHistoryItem>, approval_id: i64) -> bool {
    let before = items.len();
    items.retain(|item| item.id != approval_id);
    items.len() != before
}

/// What a history row must look like to belong to a live request. Request
/// ids get reused within a session, so the id alone is not enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestShape {
    pub command: Option<String>,
    pub file_path: Option<String>,
}

impl From<&ApprovalRequest> for RequestShape {
    fn from(request: &ApprovalRequest) -> Self {
        Self {
            command: request.command.clone(),
            file_path: request.file_path.clone(),
        }
    }
}

impl RequestShape {
    fn matches(&self, item: &ApprovalHistoryItem) -> bool {
        item.command == self.command && item.file_path == self.file_path
    }
}

/// Mark the newest unresolved row for this request as decided.
pub fn resolve_locally(
    items: &mut [ApprovalHistoryItem],
    session_id: &str,
    request_id: &str,
    shape: &RequestShape,
    decision: &str,
    now: &str,
) -> bool {
    let target = items.iter_mut().find(|item| {
        item.session_id == session_id
            && item.request_id == request_id
            && !item.is_resolved()
            && shape.matches(item)
    });
    match target {
        Some(item) => {
            item.decision = Some(decision.to_string());
            item.decided_at = Some(now.to_string());
            true
        }
        None => false,
    }
}
