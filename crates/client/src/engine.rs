//! Sync engine. One actor task owns the store, the subscription registry,
//! the connection supervisor and the outbound sender.
//!
//! External callers talk to it through `EngineHandle`, which sends
//! `EngineCommand`s over an mpsc channel. Connect attempts, the receive loop,
//! backoff timers and delayed refreshes run as separate tasks that report
//! back through the same channel, holding only a weak sender so dropping
//! every handle stops the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use orbitdock_protocol::{
    ApprovalDecision, ApprovalHistoryItem, ClientMessage, CodexModelOption, Provider,
    SessionSummary,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::actions::{self, chrono_now, Action};
use crate::command::{EngineCommand, Established};
use crate::config::SyncConfig;
use crate::dispatch::{decode_frame, EngineEvent, EventBus};
use crate::error::EngineError;
use crate::reconcile::{reconcile, Effect};
use crate::store::{SessionObserver, SessionStore, StoreViews};
use crate::subscriptions::SubscriptionRegistry;
use crate::supervisor::{ConnectionState, NextStep, Supervisor};
use crate::transport::{verify_liveness, InboundFrame, OutboundFrame, Transport, WsTransport};

const COMMAND_CAPACITY: usize = 256;

pub struct SyncEngine;

impl SyncEngine {
    /// Start the engine on the current tokio runtime and begin connecting.
    pub fn spawn(config: SyncConfig, transport: Arc<dyn Transport>) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let actor = EngineActor::new(config, transport, command_tx.downgrade(), state_tx);
        let views = actor.store.views();
        let events = actor.events.clone();
        tokio::spawn(actor.run(command_rx));

        EngineHandle {
            commands: command_tx,
            views,
            events,
            connection: state_rx,
        }
    }

    /// Spawn against the configured WebSocket server.
    pub fn spawn_ws(config: SyncConfig) -> EngineHandle {
        let transport = WsTransport::new(
            config.server_url.clone(),
            config.auth_token.clone(),
            config.connect_timeout,
        );
        Self::spawn(config, Arc::new(transport))
    }
}

/// Handle to a running engine (cheap to Clone).
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    views: StoreViews,
    events: EventBus,
    connection: watch::Receiver<ConnectionState>,
}

impl EngineHandle {
    async fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        let name = cmd.name();
        self.commands.send(cmd).await.map_err(|_| {
            warn!(
                component = "engine",
                event = "engine.command.dropped",
                command = name,
                "Engine channel closed, command dropped"
            );
            EngineError::Stopped
        })
    }

    async fn act(&self, action: Action) -> Result<(), EngineError> {
        self.send(EngineCommand::Action(action)).await
    }

    /// Observer for one session, created on first reference.
    pub async fn observe(&self, session_id: &str) -> Result<SessionObserver, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Observe {
            session_id: session_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Session list in server order.
    pub fn sessions(&self) -> Arc<Vec<SessionSummary>> {
        self.views.sessions.load_full()
    }

    pub fn global_approvals(&self) -> Arc<Vec<ApprovalHistoryItem>> {
        self.views.global_approvals.load_full()
    }

    pub fn models(&self) -> Arc<Vec<CodexModelOption>> {
        self.views.models.load_full()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn connection_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<(), EngineError> {
        self.send(EngineCommand::Subscribe {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn unsubscribe(&self, session_id: &str) -> Result<(), EngineError> {
        self.send(EngineCommand::Unsubscribe {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn decide(
        &self,
        session_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), EngineError> {
        self.act(Action::Decide {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            decision,
        })
        .await
    }

    pub async fn approve(&self, session_id: &str, request_id: &str) -> Result<(), EngineError> {
        self.decide(session_id, request_id, ApprovalDecision::Approved)
            .await
    }

    pub async fn deny(&self, session_id: &str, request_id: &str) -> Result<(), EngineError> {
        self.decide(session_id, request_id, ApprovalDecision::Denied)
            .await
    }

    pub async fn answer(
        &self,
        session_id: &str,
        request_id: &str,
        answer: &str,
    ) -> Result<(), EngineError> {
        self.act(Action::Answer {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            answer: answer.to_string(),
        })
        .await
    }

    pub async fn rename(&self, session_id: &str, name: Option<String>) -> Result<(), EngineError> {
        self.act(Action::Rename {
            session_id: session_id.to_string(),
            name,
        })
        .await
    }

    pub async fn update_config(
        &self,
        session_id: &str,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    ) -> Result<(), EngineError> {
        self.act(Action::UpdateConfig {
            session_id: session_id.to_string(),
            approval_policy,
            sandbox_mode,
        })
        .await
    }

    pub async fn fork(
        &self,
        session_id: &str,
        nth_user_message: Option<u32>,
    ) -> Result<(), EngineError> {
        self.act(Action::Fork {
            session_id: session_id.to_string(),
            nth_user_message,
        })
        .await
    }

    pub async fn delete_approval(&self, approval_id: i64) -> Result<(), EngineError> {
        self.act(Action::DeleteApproval { approval_id }).await
    }

    pub async fn create_session(
        &self,
        provider: Provider,
        cwd: &str,
        model: Option<String>,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    ) -> Result<(), EngineError> {
        self.act(Action::CreateSession {
            provider,
            cwd: cwd.to_string(),
            model,
            approval_policy,
            sandbox_mode,
        })
        .await
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        model: Option<String>,
        effort: Option<String>,
    ) -> Result<(), EngineError> {
        self.act(Action::SendMessage {
            session_id: session_id.to_string(),
            content: content.to_string(),
            model,
            effort,
        })
        .await
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<(), EngineError> {
        self.act(Action::Interrupt {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn end_session(&self, session_id: &str) -> Result<(), EngineError> {
        self.act(Action::End {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn list_global_approvals(&self) -> Result<(), EngineError> {
        self.act(Action::ListGlobalApprovals).await
    }

    pub async fn list_models(&self) -> Result<(), EngineError> {
        self.act(Action::ListModels).await
    }

    pub async fn compact_context(&self, session_id: &str) -> Result<(), EngineError> {
        self.act(Action::CompactContext {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn undo_last_turn(&self, session_id: &str) -> Result<(), EngineError> {
        self.act(Action::UndoLastTurn {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Reset the retry budget and reconnect now, including after `GaveUp`.
    pub async fn restart(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Restart).await
    }

    /// Stop the engine and wait for its background tasks to be cancelled.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

struct EngineActor {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    store: SessionStore,
    registry: SubscriptionRegistry,
    supervisor: Supervisor,
    events: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::WeakSender<EngineCommand>,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    connecting: Option<AbortHandle>,
    receiver: Option<AbortHandle>,
    reconnect_timer: Option<AbortHandle>,
    refreshes: HashMap<String, Vec<AbortHandle>>,
}

impl EngineActor {
    fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        commands: mpsc::WeakSender<EngineCommand>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            supervisor: Supervisor::new(config.reconnect),
            events: EventBus::new(config.event_buffer),
            config,
            transport,
            store: SessionStore::new(),
            registry: SubscriptionRegistry::new(),
            state_tx,
            commands,
            outbound: None,
            connecting: None,
            receiver: None,
            reconnect_timer: None,
            refreshes: HashMap::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        info!(
            component = "engine",
            event = "engine.started",
            server_url = %self.config.server_url,
            "Sync engine started"
        );
        self.start_attempt();

        while let Some(cmd) = commands.recv().await {
            if let EngineCommand::Shutdown { reply } = cmd {
                commands.close();
                self.teardown();
                let _ = reply.send(());
                break;
            }
            self.handle(cmd).await;
        }

        self.teardown();
        info!(
            component = "engine",
            event = "engine.stopped",
            "Sync engine stopped"
        );
    }

    async fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Observe { session_id, reply } => {
                let observer = self.store.observe(&session_id);
                let _ = reply.send(observer);
            }

            EngineCommand::Subscribe { session_id } => {
                self.store.get_or_create(&session_id);
                self.store.publish();
                if let Some(cmd) = self.registry.subscribe(&session_id) {
                    self.send(cmd).await;
                    self.send(self.list_approvals(Some(session_id))).await;
                }
            }

            EngineCommand::Unsubscribe { session_id } => {
                if let Some(cmd) = self.registry.unsubscribe(&session_id) {
                    self.send(cmd).await;
                }
            }

            EngineCommand::Action(action) => {
                let effects = actions::apply(
                    &mut self.store,
                    action,
                    self.config.approval_page_limit,
                    &chrono_now(),
                );
                self.store.publish();
                self.run_effects(effects).await;
            }

            EngineCommand::Restart => {
                self.drop_connection();
                self.cancel_timer();
                self.supervisor.restart();
                self.publish_state();
                self.start_attempt();
            }

            // Handled by the run loop, which also closes the channel.
            EngineCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }

            EngineCommand::ConnectResult { generation, result } => {
                if generation == self.supervisor.generation() {
                    self.connecting = None;
                }
                match result {
                    Ok(established) => self.on_established(generation, established).await,
                    Err(e) => {
                        warn!(
                            component = "engine",
                            event = "engine.connect.failed",
                            generation,
                            error = %e,
                            "Connect attempt failed"
                        );
                        let step = self.supervisor.connect_failed(generation);
                        self.follow(step);
                    }
                }
            }

            EngineCommand::Inbound { generation, text } => {
                if generation == self.supervisor.generation()
                    && self.supervisor.state() == ConnectionState::Connected
                {
                    self.dispatch(&text).await;
                }
            }

            EngineCommand::ReceiveFailed { generation } => {
                let step = self.supervisor.receive_failed(generation);
                if !matches!(step, NextStep::Ignore) {
                    self.drop_connection();
                    self.publish_state();
                }
                self.follow(step);
            }

            EngineCommand::Reconnect => {
                self.reconnect_timer = None;
                self.start_attempt();
            }

            EngineCommand::RefreshApprovals { session_id } => {
                if self.store.contains(&session_id) {
                    self.refresh_approvals(&session_id).await;
                } else {
                    debug!(
                        component = "engine",
                        event = "engine.refresh.stale",
                        session_id = %session_id,
                        "Skipping refresh for removed session"
                    );
                }
            }
        }
    }

    // -- Connection lifecycle -------------------------------------------

    fn start_attempt(&mut self) {
        let Some(generation) = self.supervisor.begin_attempt() else {
            return;
        };
        self.publish_state();

        let transport = self.transport.clone();
        let probe_timeout = self.config.probe_timeout;
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            let result = async {
                let mut conn = transport.connect().await?;
                let early = verify_liveness(&mut conn, probe_timeout).await?;
                Ok(Established { conn, early })
            }
            .await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx
                    .send(EngineCommand::ConnectResult { generation, result })
                    .await;
            }
        });
        self.connecting = Some(task.abort_handle());
    }

    async fn on_established(&mut self, generation: u64, established: Established) {
        if !self.supervisor.connected(generation) {
            debug!(
                component = "engine",
                event = "engine.connect.stale",
                generation,
                "Dropping connection from a superseded attempt"
            );
            return;
        }
        let Established { conn, early } = established;
        self.outbound = Some(conn.outbound);
        let task = tokio::spawn(receive_loop(generation, conn.inbound, self.commands.clone()));
        self.receiver = Some(task.abort_handle());
        self.publish_state();

        for text in early {
            self.dispatch(&text).await;
        }

        self.send(ClientMessage::SubscribeList).await;
        self.send(ClientMessage::ListModels).await;
        self.send(self.list_approvals(None)).await;

        let replay = self.registry.take_for_replay();
        info!(
            component = "engine",
            event = "engine.subscriptions.replay",
            generation,
            sessions = replay.len(),
            "Replaying subscriptions"
        );
        for session_id in replay {
            if let Some(cmd) = self.registry.subscribe(&session_id) {
                self.send(cmd).await;
                self.send(self.list_approvals(Some(session_id))).await;
            }
        }
    }

    fn follow(&mut self, step: NextStep) {
        match step {
            NextStep::Retry(delay) => {
                self.publish_state();
                self.schedule_reconnect(delay);
            }
            NextStep::GaveUp => self.publish_state(),
            NextStep::Ignore => {}
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_timer();
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(EngineCommand::Reconnect).await;
            }
        });
        self.reconnect_timer = Some(task.abort_handle());
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn drop_connection(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
        self.outbound = None;
    }

    fn publish_state(&mut self) {
        let state = self.supervisor.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            self.events.publish(EngineEvent::Connection(state));
        }
    }

    fn teardown(&mut self) {
        self.drop_connection();
        self.cancel_timer();
        for (_, tasks) in self.refreshes.drain() {
            for task in tasks {
                task.abort();
            }
        }
    }

    // -- Inbound ----------------------------------------------------------

    async fn dispatch(&mut self, text: &str) {
        let decoded = decode_frame(text);
        if let Some(marker) = decoded.revision {
            self.registry
                .record_revision(&marker.session_id, marker.revision);
        }
        let Some(message) = decoded.message else {
            return;
        };
        let effects = reconcile(&mut self.store, &mut self.registry, &message, &chrono_now());
        self.store.publish();
        self.events.publish(EngineEvent::Server(Arc::new(message)));
        self.run_effects(effects).await;
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(cmd) => self.send(cmd).await,
                Effect::RefreshApprovals {
                    session_id,
                    follow_up,
                } => {
                    self.refresh_approvals(&session_id).await;
                    if follow_up {
                        self.schedule_follow_ups(&session_id);
                    }
                }
                Effect::Surface(event) => self.events.publish(event),
                Effect::CancelSession(session_id) => self.cancel_session(&session_id),
            }
        }
    }

    // -- Outbound ---------------------------------------------------------

    /// Fire-and-forget; a dead socket shows up as a receive failure.
    async fn send(&mut self, cmd: ClientMessage) {
        let Some(outbound) = &self.outbound else {
            debug!(
                component = "engine",
                event = "engine.send.offline",
                session_id = ?cmd.session_id(),
                "Not connected, command dropped"
            );
            return;
        };
        let json = match serde_json::to_string(&cmd) {
            Ok(json) => json,
            Err(e) => {
                warn!(
                    component = "engine",
                    event = "engine.send.serialize_failed",
                    error = %e,
                    "Failed to serialize command"
                );
                return;
            }
        };
        if outbound.send(OutboundFrame::Text(json)).await.is_err() {
            debug!(
                component = "engine",
                event = "engine.send.closed",
                "Outbound channel closed"
            );
        }
    }

    fn list_approvals(&self, session_id: Option<String>) -> ClientMessage {
        ClientMessage::ListApprovals {
            session_id,
            limit: Some(self.config.approval_page_limit),
        }
    }

    async fn refresh_approvals(&mut self, session_id: &str) {
        self.send(self.list_approvals(Some(session_id.to_string())))
            .await;
        self.send(self.list_approvals(None)).await;
    }

    /// Best-effort re-reads that give the server time to persist a decision.
    fn schedule_follow_ups(&mut self, session_id: &str) {
        let tasks = self.refreshes.entry(session_id.to_string()).or_default();
        tasks.retain(|t| !t.is_finished());
        for delay in &self.config.approval_refresh_delays {
            let delay = *delay;
            let commands = self.commands.clone();
            let session_id = session_id.to_string();
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(tx) = commands.upgrade() {
                    let _ = tx.send(EngineCommand::RefreshApprovals { session_id }).await;
                }
            });
            tasks.push(task.abort_handle());
        }
    }

    fn cancel_session(&mut self, session_id: &str) {
        if let Some(tasks) = self.refreshes.remove(session_id) {
            debug!(
                component = "engine",
                event = "engine.session.cancelled",
                session_id = %session_id,
                tasks = tasks.len(),
            );
            for task in tasks {
                task.abort();
            }
        }
    }
}

/// Forwards text frames until the connection ends, then reports the failure.
/// Aborted without a report when the engine replaces the connection.
async fn receive_loop(
    generation: u64,
    mut inbound: mpsc::Receiver<InboundFrame>,
    commands: mpsc::WeakSender<EngineCommand>,
) {
    while let Some(frame) = inbound.recv().await {
        let InboundFrame::Text(text) = frame else {
            continue;
        };
        let Some(tx) = commands.upgrade() else {
            return;
        };
        if tx
            .send(EngineCommand::Inbound { generation, text })
            .await
            .is_err()
        {
            return;
        }
    }
    if let Some(tx) = commands.upgrade() {
        let _ = tx.send(EngineCommand::ReceiveFailed { generation }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use orbitdock_protocol::{
        ApprovalRequest, ApprovalType, Message, MessageType, Patch, ServerMessage, SessionState,
        SessionStatus, StateChanges, TokenUsage, WorkStatus,
    };

    use crate::store::SessionRecord;
    use crate::supervisor::ReconnectPolicy;
    use crate::transport::memory::{MemoryTransport, Script, ServerPeer};

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_config() -> SyncConfig {
        SyncConfig {
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
            connect_timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            approval_refresh_delays: vec![Duration::from_millis(30), Duration::from_millis(60)],
            ..SyncConfig::default()
        }
    }

    fn accept() -> Script {
        Script::Accept { answer_ping: true }
    }

    async fn wait_for_state(handle: &EngineHandle, target: ConnectionState) {
        let mut rx = handle.connection_changes();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
            .await
            .expect("timed out waiting for connection state")
            .expect("engine stopped");
    }

    async fn wait_until(
        observer: &mut SessionObserver,
        pred: impl Fn(&SessionRecord) -> bool,
    ) -> Arc<SessionRecord> {
        tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = observer.snapshot();
                if pred(&snapshot) {
                    return snapshot;
                }
                assert!(observer.changed().await, "session was removed");
            }
        })
        .await
        .expect("timed out waiting for session state")
    }

    /// Accept the next connection and consume the post-connect handshake.
    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<ServerPeer>) -> ServerPeer {
        let mut peer = tokio::time::timeout(WAIT, peers.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("transport dropped");
        assert_eq!(peer.recv_command().await, ClientMessage::SubscribeList);
        assert_eq!(peer.recv_command().await, ClientMessage::ListModels);
        assert_eq!(
            peer.recv_command().await,
            ClientMessage::ListApprovals {
                session_id: None,
                limit: Some(200)
            }
        );
        peer
    }

    fn snapshot(id: &str, pending: Option<ApprovalRequest>) -> ServerMessage {
        ServerMessage::SessionSnapshot {
            session: SessionState {
                id: id.into(),
                provider: Provider::Codex,
                project_path: "/tmp/repo".into(),
                project_name: None,
                model: None,
                custom_name: None,
                status: SessionStatus::Active,
                work_status: WorkStatus::Waiting,
                messages: vec![Message {
                    id: "m1".into(),
                    session_id: id.into(),
                    message_type: MessageType::User,
                    content: "hello".into(),
                    tool_name: None,
                    tool_input: None,
                    tool_output: None,
                    is_error: false,
                    is_in_progress: false,
                    timestamp: "1Z".into(),
                    duration_ms: None,
                    input_tokens: None,
                    output_tokens: None,
                }],
                pending_approval: pending,
                token_usage: TokenUsage::default(),
                current_diff: None,
                current_plan: None,
                codex_integration_mode: None,
                approval_policy: None,
                sandbox_mode: None,
                forked_from_session_id: None,
                started_at: None,
                last_activity_at: None,
                revision: Some(1),
            },
        }
    }

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            id: id.into(),
            session_id: "S1".into(),
            approval_type: ApprovalType::Exec,
            command: Some("cargo test".into()),
            file_path: None,
            diff: None,
            question: None,
            proposed_amendment: None,
        }
    }

    fn history_row(decision: Option<&str>) -> ApprovalHistoryItem {
        ApprovalHistoryItem {
            id: 1,
            session_id: "S1".into(),
            request_id: "r1".into(),
            approval_type: ApprovalType::Exec,
            tool_name: Some("Bash".into()),
            command: Some("cargo test".into()),
            file_path: None,
            cwd: None,
            decision: decision.map(str::to_string),
            proposed_amendment: None,
            created_at: "2Z".into(),
            decided_at: decision.map(|_| "3Z".to_string()),
        }
    }

    fn is_subscribe(cmd: &ClientMessage) -> bool {
        matches!(cmd, ClientMessage::SubscribeSession { .. })
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_restart_recovers() {
        let (transport, mut peers) = MemoryTransport::new(vec![]);
        let attempts = transport.attempts();
        let transport = Arc::new(transport);
        let handle = SyncEngine::spawn(fast_config(), transport.clone());

        wait_for_state(&handle, ConnectionState::GaveUp).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            3,
            "no automatic attempts after giving up"
        );

        transport.push_script(accept());
        handle.restart().await.expect("restart");
        let _peer = next_peer(&mut peers).await;
        wait_for_state(&handle, ConnectionState::Connected).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn unanswered_ping_counts_as_failed_attempt() {
        let (transport, mut peers) =
            MemoryTransport::new(vec![Script::Accept { answer_ping: false }, accept()]);
        let attempts = transport.attempts();
        let handle = SyncEngine::spawn(fast_config(), Arc::new(transport));

        // The silent peer is handed out first; the healthy one follows.
        let silent = tokio::time::timeout(WAIT, peers.recv())
            .await
            .expect("first connection")
            .expect("transport dropped");
        let _peer = next_peer(&mut peers).await;
        wait_for_state(&handle, ConnectionState::Connected).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        drop(silent);
    }

    #[tokio::test]
    async fn reconnect_replays_each_subscription_once_with_cursor() {
        let (transport, mut peers) = MemoryTransport::new(vec![accept(), accept()]);
        let handle = SyncEngine::spawn(fast_config(), Arc::new(transport));

        let mut first = next_peer(&mut peers).await;
        handle.subscribe("a").await.expect("subscribe a");
        handle.subscribe("b").await.expect("subscribe b");
        handle.subscribe("a").await.expect("subscribe a again");
        let sent = first
            .recv_until(|c| {
                matches!(c, ClientMessage::ListApprovals { session_id: Some(id), .. } if id == "b")
            })
            .await;
        assert_eq!(sent.iter().filter(|c| is_subscribe(c)).count(), 2);

        first
            .push_raw(
                r#"{"type":"tokens_updated","session_id":"a","revision":7,
                    "usage":{"input_tokens":1,"output_tokens":1,"cached_tokens":0,"context_window":10}}"#
                    .to_string(),
            )
            .await;
        // Let the frame land before the socket dies.
        let mut observer = handle.observe("a").await.expect("observe");
        wait_until(&mut observer, |r| r.token_usage.input_tokens == 1).await;
        drop(first);

        let mut second = next_peer(&mut peers).await;
        let replay = second
            .recv_until(|c| {
                matches!(c, ClientMessage::ListApprovals { session_id: Some(id), .. } if id == "b")
            })
            .await;
        let subscribes: Vec<&ClientMessage> = replay.iter().filter(|c| is_subscribe(c)).collect();
        assert_eq!(
            subscribes,
            vec![
                &ClientMessage::SubscribeSession {
                    session_id: "a".into(),
                    since_revision: Some(7),
                },
                &ClientMessage::SubscribeSession {
                    session_id: "b".into(),
                    since_revision: None,
                },
            ]
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.drain().iter().any(is_subscribe));
    }

    #[tokio::test]
    async fn approve_is_optimistic_then_converges() {
        let (transport, mut peers) = MemoryTransport::new(vec![accept()]);
        let handle = SyncEngine::spawn(fast_config(), Arc::new(transport));
        let mut peer = next_peer(&mut peers).await;

        handle.subscribe("S1").await.expect("subscribe");
        let mut observer = handle.observe("S1").await.expect("observe");
        peer.push(&snapshot("S1", None)).await;
        peer.push(&ServerMessage::SessionDelta {
            session_id: "S1".into(),
            changes: StateChanges {
                pending_approval: Patch::Set(request("r1")),
                work_status: Some(WorkStatus::Permission),
                ..Default::default()
            },
        })
        .await;
        // Subscribe, its history read, then the refresh for the new request.
        peer.recv_until(|c| matches!(c, ClientMessage::ListApprovals { session_id: None, .. }))
            .await;
        peer.push(&ServerMessage::ApprovalsList {
            session_id: Some("S1".into()),
            approvals: vec![history_row(None)],
        })
        .await;
        let record = wait_until(&mut observer, |r| {
            r.pending_approval.is_some() && !r.approval_history.is_empty()
        })
        .await;
        assert_eq!(record.messages[0].content, "hello");

        handle.approve("S1", "r1").await.expect("approve");
        let record = wait_until(&mut observer, |r| r.pending_approval.is_none()).await;
        assert_eq!(record.work_status, WorkStatus::Working);
        assert_eq!(
            record.approval_history[0].decision.as_deref(),
            Some("approved")
        );

        let sent = peer
            .recv_until(|c| matches!(c, ClientMessage::ListApprovals { session_id: None, .. }))
            .await;
        assert!(matches!(
            sent.first(),
            Some(ClientMessage::ApproveTool {
                decision: ApprovalDecision::Approved,
                ..
            })
        ));
        // Follow-up re-reads arrive on their own.
        peer.recv_until(|c| matches!(c, ClientMessage::ListApprovals { session_id: Some(_), .. }))
            .await;

        // A page served before the server persisted the decision must not regress it.
        peer.push(&ServerMessage::ApprovalsList {
            session_id: Some("S1".into()),
            approvals: vec![history_row(None)],
        })
        .await;
        peer.push(&ServerMessage::ApprovalsList {
            session_id: Some("S1".into()),
            approvals: vec![history_row(Some("approved"))],
        })
        .await;
        let record = wait_until(&mut observer, |r| {
            r.approval_history[0].decided_at.as_deref() == Some("3Z")
        })
        .await;
        assert_eq!(
            record.approval_history[0].decision.as_deref(),
            Some("approved")
        );
    }

    #[tokio::test]
    async fn lagged_error_resubscribes_and_surfaces() {
        let (transport, mut peers) = MemoryTransport::new(vec![accept()]);
        let handle = SyncEngine::spawn(fast_config(), Arc::new(transport));
        let mut peer = next_peer(&mut peers).await;
        let mut events = handle.events();

        handle.subscribe("S2").await.expect("subscribe");
        peer.recv_until(|c| matches!(c, ClientMessage::ListApprovals { .. }))
            .await;

        peer.push(&ServerMessage::Error {
            code: "lagged".into(),
            message: "subscriber lagged".into(),
            session_id: Some("S2".into()),
        })
        .await;

        assert_eq!(
            peer.recv_command().await,
            ClientMessage::UnsubscribeSession {
                session_id: "S2".into()
            }
        );
        assert_eq!(
            peer.recv_command().await,
            ClientMessage::SubscribeSession {
                session_id: "S2".into(),
                since_revision: None,
            }
        );
        assert_eq!(
            peer.recv_command().await,
            ClientMessage::ListApprovals {
                session_id: Some("S2".into()),
                limit: Some(200),
            }
        );
        assert_eq!(
            peer.recv_command().await,
            ClientMessage::ListApprovals {
                session_id: None,
                limit: Some(200),
            }
        );

        let surfaced = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(EngineEvent::ServerError { code, .. }) = events.recv().await {
                    return code;
                }
            }
        })
        .await
        .expect("error surfaced");
        assert_eq!(surfaced, "lagged");
    }

    #[tokio::test]
    async fn stale_connect_result_keeps_current_attempt_abortable() {
        let mut config = fast_config();
        config.probe_timeout = Duration::from_secs(5);
        let (transport, _peers) = MemoryTransport::new(vec![
            Script::Accept { answer_ping: false },
            Script::Accept { answer_ping: false },
        ]);
        let (command_tx, _command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let mut actor = EngineActor::new(
            config,
            Arc::new(transport),
            command_tx.downgrade(),
            state_tx,
        );

        actor.start_attempt();
        assert_eq!(actor.supervisor.generation(), 1);
        actor.handle(EngineCommand::Restart).await;
        let current = actor.supervisor.generation();
        assert!(current > 1);
        assert!(actor.connecting.is_some());

        actor
            .handle(EngineCommand::ConnectResult {
                generation: 1,
                result: Err(crate::error::TransportError::Closed),
            })
            .await;
        assert!(actor.connecting.is_some());
        assert_eq!(actor.supervisor.generation(), current);
        assert_eq!(actor.supervisor.state(), ConnectionState::Connecting);

        actor.teardown();
        assert!(actor.connecting.is_none());
    }

    #[tokio::test]
    async fn removed_session_gets_no_follow_up_refresh() {
        let (transport, mut peers) = MemoryTransport::new(vec![accept()]);
        let handle = SyncEngine::spawn(fast_config(), Arc::new(transport));
        let mut peer = next_peer(&mut peers).await;

        handle.subscribe("S1").await.expect("subscribe");
        let mut observer = handle.observe("S1").await.expect("observe");
        peer.push(&snapshot("S1", Some(request("r1")))).await;
        wait_until(&mut observer, |r| r.has_snapshot).await;

        peer.push(&ServerMessage::SessionDelta {
            session_id: "S1".into(),
            changes: StateChanges {
                pending_approval: Patch::Cleared,
                ..Default::default()
            },
        })
        .await;
        peer.push(&ServerMessage::SessionsList { sessions: vec![] })
            .await;
        tokio::time::timeout(WAIT, async { while observer.changed().await {} })
            .await
            .expect("session removed");

        // Immediate refresh goes out; the delayed ones must not.
        peer.recv_until(|c| matches!(c, ClientMessage::ListApprovals { session_id: None, .. }))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let late = peer.drain();
        assert!(
            !late
                .iter()
                .any(|c| matches!(c, ClientMessage::ListApprovals { .. })),
            "unexpected refresh after removal: {late:?}"
        );
        assert!(handle.sessions().is_empty());
    }

    #[tokio::test]
    async fn stale_receive_failure_is_ignored_after_restart() {
        let (transport, mut peers) = MemoryTransport::new(vec![accept(), accept()]);
        let handle = SyncEngine::spawn(fast_config(), Arc::new(transport));
        let first = next_peer(&mut peers).await;

        handle.restart().await.expect("restart");
        let _second = next_peer(&mut peers).await;
        wait_for_state(&handle, ConnectionState::Connected).await;

        // The old connection dying must not disturb the new one.
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn shutdown_stops_engine() {
        let (transport, mut peers) = MemoryTransport::new(vec![accept()]);
        let handle = SyncEngine::spawn(fast_config(), Arc::new(transport));
        let _peer = next_peer(&mut peers).await;

        handle.shutdown().await.expect("shutdown");
        assert!(matches!(
            handle.subscribe("x").await,
            Err(EngineError::Stopped)
        ));
    }
}
