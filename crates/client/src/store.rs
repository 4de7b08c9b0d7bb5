//! Session state store, the local mirror.
//!
//! Owned and mutated only by the engine task. Every mutation marks the
//! record dirty; `publish` then swaps fresh copies into the `ArcSwap`s that
//! observers read lock-free and bumps their change counters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use orbitdock_protocol::{
    ApprovalHistoryItem, ApprovalRequest, CodexIntegrationMode, CodexModelOption, Message,
    Provider, SessionStatus, SessionSummary, TokenUsage, WorkStatus,
};
use tokio::sync::watch;
use tracing::debug;

/// Everything the client knows about one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    /// Unknown until the first summary or snapshot.
    pub provider: Option<Provider>,
    pub project_path: String,
    pub project_name: Option<String>,
    pub model: Option<String>,
    pub custom_name: Option<String>,
    pub status: SessionStatus,
    pub work_status: WorkStatus,
    pub has_pending_approval: bool,
    pub codex_integration_mode: Option<CodexIntegrationMode>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    /// Lookup only.
    pub forked_from_session_id: Option<String>,
    pub started_at: Option<String>,
    pub last_activity_at: Option<String>,

    pub messages: Vec<Message>,
    /// Message ids already completed by a content-bearing update.
    pub finalized_messages: HashSet<String>,
    pub pending_approval: Option<ApprovalRequest>,
    pub token_usage: TokenUsage,
    pub current_diff: Option<String>,
    pub current_plan: Option<String>,
    /// Sorted by id descending.
    pub approval_history: Vec<ApprovalHistoryItem>,

    /// Bumped on every message upsert or replace.
    pub message_revision: u64,
    pub fork_in_progress: bool,
    pub has_snapshot: bool,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: None,
            project_path: String::new(),
            project_name: None,
            model: None,
            custom_name: None,
            status: SessionStatus::Active,
            work_status: WorkStatus::Waiting,
            has_pending_approval: false,
            codex_integration_mode: None,
            approval_policy: None,
            sandbox_mode: None,
            forked_from_session_id: None,
            started_at: None,
            last_activity_at: None,
            messages: Vec::new(),
            finalized_messages: HashSet::new(),
            pending_approval: None,
            token_usage: TokenUsage::default(),
            current_diff: None,
            current_plan: None,
            approval_history: Vec::new(),
            message_revision: 0,
            fork_in_progress: false,
            has_snapshot: false,
        }
    }

    /// Title for list views: custom name, then project name, then path.
    pub fn display_name(&self) -> &str {
        self.custom_name
            .as_deref()
            .or(self.project_name.as_deref())
            .unwrap_or(&self.project_path)
    }

    pub fn set_pending_approval(&mut self, request: Option<ApprovalRequest>) {
        self.has_pending_approval = request.is_some();
        self.pending_approval = request;
    }

    pub fn apply_summary(&mut self, summary: &SessionSummary) {
        self.provider = Some(summary.provider);
        self.project_path = summary.project_path.clone();
        self.project_name = summary.project_name.clone();
        self.model = summary.model.clone();
        self.custom_name = summary.custom_name.clone();
        self.status = summary.status;
        self.work_status = summary.work_status;
        self.has_pending_approval = summary.has_pending_approval;
        self.codex_integration_mode = summary.codex_integration_mode;
        self.approval_policy = summary.approval_policy.clone();
        self.sandbox_mode = summary.sandbox_mode.clone();
        if summary.forked_from_session_id.is_some() {
            self.forked_from_session_id = summary.forked_from_session_id.clone();
        }
        self.started_at = summary.started_at.clone();
        self.last_activity_at = summary.last_activity_at.clone();
    }

    /// `None` until the provider is known.
    pub fn summary(&self) -> Option<SessionSummary> {
        Some(SessionSummary {
            id: self.id.clone(),
            provider: self.provider?,
            project_path: self.project_path.clone(),
            project_name: self.project_name.clone(),
            model: self.model.clone(),
            custom_name: self.custom_name.clone(),
            status: self.status,
            work_status: self.work_status,
            has_pending_approval: self.has_pending_approval,
            codex_integration_mode: self.codex_integration_mode,
            approval_policy: self.approval_policy.clone(),
            sandbox_mode: self.sandbox_mode.clone(),
            forked_from_session_id: self.forked_from_session_id.clone(),
            started_at: self.started_at.clone(),
            last_activity_at: self.last_activity_at.clone(),
        })
    }
}

struct Entry {
    record: SessionRecord,
    published: Arc<ArcSwap<SessionRecord>>,
    version: watch::Sender<u64>,
}

impl Entry {
    fn new(id: &str) -> Self {
        let record = SessionRecord::new(id);
        let (version, _) = watch::channel(0);
        Self {
            published: Arc::new(ArcSwap::from_pointee(record.clone())),
            record,
            version,
        }
    }

    fn publish(&self) {
        self.published.store(Arc::new(self.record.clone()));
        self.version.send_modify(|v| *v += 1);
    }
}

/// Stable, observable handle on one session.
#[derive(Clone)]
pub struct SessionObserver {
    id: String,
    snapshot: Arc<ArcSwap<SessionRecord>>,
    changes: watch::Receiver<u64>,
}

impl SessionObserver {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lock-free read of the latest published state.
    pub fn snapshot(&self) -> Arc<SessionRecord> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        *self.changes.borrow()
    }

    /// Wait for the next publish. Returns false once the session was removed
    /// from the store.
    pub async fn changed(&mut self) -> bool {
        self.changes.changed().await.is_ok()
    }
}

/// Read-only aggregate views, shared with `EngineHandle`.
#[derive(Clone)]
pub struct StoreViews {
    pub sessions: Arc<ArcSwap<Vec<SessionSummary>>>,
    pub global_approvals: Arc<ArcSwap<Vec<ApprovalHistoryItem>>>,
    pub models: Arc<ArcSwap<Vec<CodexModelOption>>>,
}

impl StoreViews {
    fn new() -> Self {
        Self {
            sessions: Arc::new(ArcSwap::from_pointee(Vec::new())),
            global_approvals: Arc::new(ArcSwap::from_pointee(Vec::new())),
            models: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }
}

pub struct SessionStore {
    entries: HashMap<String, Entry>,
    /// Server list order, then first-seen order for the rest.
    order: Vec<String>,
    global_approvals: Vec<ApprovalHistoryItem>,
    models: Vec<CodexModelOption>,
    dirty: HashSet<String>,
    aggregates_dirty: bool,
    views: StoreViews,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            global_approvals: Vec::new(),
            models: Vec::new(),
            dirty: HashSet::new(),
            aggregates_dirty: false,
            views: StoreViews::new(),
        }
    }

    pub fn views(&self) -> StoreViews {
        self.views.clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord> {
        self.entries.get(id).map(|e| &e.record)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionRecord> {
        let entry = self.entries.get_mut(id)?;
        self.dirty.insert(id.to_string());
        self.aggregates_dirty = true;
        Some(&mut entry.record)
    }

    /// Sessions are created on first reference.
    pub fn get_or_create(&mut self, id: &str) -> &mut SessionRecord {
        self.dirty.insert(id.to_string());
        self.aggregates_dirty = true;
        let order = &mut self.order;
        &mut self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(
                    component = "store",
                    event = "store.session.created",
                    session_id = %id,
                );
                order.push(id.to_string());
                Entry::new(id)
            })
            .record
    }

    /// Drops the record; observers see `changed()` return false.
    pub fn remove(&mut self, id: &str) -> bool {
        if self.entries.remove(id).is_none() {
            return false;
        }
        debug!(
            component = "store",
            event = "store.session.removed",
            session_id = %id,
        );
        self.order.retain(|o| o != id);
        self.dirty.remove(id);
        self.aggregates_dirty = true;
        true
    }

    /// Reorder to match the server's list; unknown ids keep their place after.
    pub fn set_order(&mut self, ids: &[String]) {
        let mut next: Vec<String> = ids
            .iter()
            .filter(|id| self.entries.contains_key(id.as_str()))
            .cloned()
            .collect();
        let listed: HashSet<&String> = ids.iter().collect();
        next.extend(self.order.iter().filter(|id| !listed.contains(id)).cloned());
        self.order = next;
        self.aggregates_dirty = true;
    }

    pub fn global_approvals(&self) -> &[ApprovalHistoryItem] {
        &self.global_approvals
    }

    pub fn global_approvals_mut(&mut self) -> &mut Vec<ApprovalHistoryItem> {
        self.aggregates_dirty = true;
        &mut self.global_approvals
    }

    pub fn models(&self) -> &[CodexModelOption] {
        &self.models
    }

    pub fn set_models(&mut self, models: Vec<CodexModelOption>) {
        self.models = models;
        self.aggregates_dirty = true;
    }

    /// Get-or-create a session and hand out an observer for it.
    pub fn observe(&mut self, id: &str) -> SessionObserver {
        self.get_or_create(id);
        self.publish();
        let entry = &self.entries[id];
        SessionObserver {
            id: id.to_string(),
            snapshot: entry.published.clone(),
            changes: entry.version.subscribe(),
        }
    }

    /// Push pending changes out to observers.
    pub fn publish(&mut self) {
        for id in self.dirty.drain() {
            if let Some(entry) = self.entries.get(&id) {
                entry.publish();
            }
        }
        if self.aggregates_dirty {
            self.aggregates_dirty = false;
            let sessions: Vec<SessionSummary> = self
                .order
                .iter()
                .filter_map(|id| self.entries.get(id))
                .filter_map(|e| e.record.summary())
                .collect();
            self.views.sessions.store(Arc::new(sessions));
            self.views
                .global_approvals
                .store(Arc::new(self.global_approvals.clone()));
            self.views.models.store(Arc::new(self.models.clone()));
        }
    }
}
