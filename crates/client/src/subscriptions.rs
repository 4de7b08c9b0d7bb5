//! Subscription registry: which sessions we want live, and from where.
//!
//! Methods return the commands to send instead of sending them, so the
//! engine stays the only place that touches the socket.

use std::collections::{HashMap, HashSet};

use orbitdock_protocol::ClientMessage;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscribed: HashSet<String>,
    cursors: HashMap<String, u64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.subscribed.contains(session_id)
    }

    pub fn subscribed(&self) -> impl Iterator<Item = &str> {
        self.subscribed.iter().map(String::as_str)
    }

    pub fn cursor(&self, session_id: &str) -> Option<u64> {
        self.cursors.get(session_id).copied()
    }

    /// Idempotent. Returns the subscribe command only on a new subscription.
    pub fn subscribe(&mut self, session_id: &str) -> Option<ClientMessage> {
        if !self.subscribed.insert(session_id.to_string()) {
            return None;
        }
        let since_revision = self.cursor(session_id);
        debug!(
            component = "subscriptions",
            event = "subscriptions.subscribe",
            session_id = %session_id,
            since_revision = ?since_revision,
        );
        Some(ClientMessage::SubscribeSession {
            session_id: session_id.to_string(),
            since_revision,
        })
    }

    /// Keeps the cursor so a later subscribe can resume.
    pub fn unsubscribe(&mut self, session_id: &str) -> Option<ClientMessage> {
        if !self.subscribed.remove(session_id) {
            return None;
        }
        debug!(
            component = "subscriptions",
            event = "subscriptions.unsubscribe",
            session_id = %session_id,
        );
        Some(ClientMessage::UnsubscribeSession {
            session_id: session_id.to_string(),
        })
    }

    /// Out-of-band marker: cursors only move forward.
    pub fn record_revision(&mut self, session_id: &str, revision: u64) {
        let cursor = self.cursors.entry(session_id.to_string()).or_insert(revision);
        if revision > *cursor {
            *cursor = revision;
        }
    }

    /// A snapshot is authoritative, including a server that restarted its
    /// counter.
    pub fn reset_revision(&mut self, session_id: &str, revision: u64) {
        self.cursors.insert(session_id.to_string(), revision);
    }

    /// Server buffer overflowed for this session: drop the cursor and
    /// resubscribe for a fresh snapshot.
    pub fn lagged(&mut self, session_id: &str) -> Vec<ClientMessage> {
        let Some(unsubscribe) = self.unsubscribe(session_id) else {
            return Vec::new();
        };
        self.cursors.remove(session_id);
        info!(
            component = "subscriptions",
            event = "subscriptions.lagged_resubscribe",
            session_id = %session_id,
            "Resubscribing after lag"
        );
        let mut out = vec![unsubscribe];
        out.extend(self.subscribe(session_id));
        out
    }

    /// Swap out and clear the tracked set; the caller resubscribes each id.
    pub fn take_for_replay(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = std::mem::take(&mut self.subscribed).into_iter().collect();
        ids.sort();
        ids
    }

    /// The session is gone from the server.
    pub fn forget(&mut self, session_id: &str) {
        self.subscribed.remove(session_id);
        self.cursors.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_is_idempotent() {
        let mut reg = SubscriptionRegistry::new();
        assert!(reg.subscribe("s1").is_some());
        assert!(reg.subscribe("s1").is_none());
        assert!(reg.is_subscribed("s1"));
    }

    #[test]
    fn subscribe_carries_last_cursor() {
        let mut reg = SubscriptionRegistry::new();
        reg.record_revision("s1", 4);
        reg.record_revision("s1", 9);
        reg.record_revision("s1", 6);
        assert_eq!(
            reg.subscribe("s1"),
            Some(ClientMessage::SubscribeSession {
                session_id: "s1".into(),
                since_revision: Some(9),
            })
        );
    }

    #[test]
    fn snapshot_reset_can_move_cursor_back() {
        let mut reg = SubscriptionRegistry::new();
        reg.record_revision("s1", 50);
        reg.reset_revision("s1", 2);
        assert_eq!(reg.cursor("s1"), Some(2));
    }

    #[test]
    fn unsubscribe_keeps_cursor_for_resume() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("s1");
        reg.record_revision("s1", 3);
        assert!(reg.unsubscribe("s1").is_some());
        assert!(reg.unsubscribe("s1").is_none());
        assert_eq!(reg.cursor("s1"), Some(3));
    }

    #[test]
    fn lagged_resubscribes_without_cursor() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("S2");
        reg.record_revision("S2", 11);

        let cmds = reg.lagged("S2");
        assert_eq!(
            cmds,
            vec![
                ClientMessage::UnsubscribeSession {
                    session_id: "S2".into()
                },
                ClientMessage::SubscribeSession {
                    session_id: "S2".into(),
                    since_revision: None,
                },
            ]
        );
        assert!(reg.is_subscribed("S2"));
        assert_eq!(reg.cursor("S2"), None);
    }

    #[test]
    fn lagged_for_unknown_session_is_noop() {
        let mut reg = SubscriptionRegistry::new();
        assert!(reg.lagged("nope").is_empty());
        assert!(!reg.is_subscribed("nope"));
    }

    #[test]
    fn replay_resubscribes_each_once_with_cursor() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("a");
        reg.subscribe("b");
        reg.record_revision("a", 5);

        let ids = reg.take_for_replay();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reg.subscribed().count(), 0);

        let cmds: Vec<_> = ids.iter().filter_map(|id| reg.subscribe(id)).collect();
        assert_eq!(
            cmds,
            vec![
                ClientMessage::SubscribeSession {
                    session_id: "a".into(),
                    since_revision: Some(5),
                },
                ClientMessage::SubscribeSession {
                    session_id: "b".into(),
                    since_revision: None,
                },
            ]
        );
    }

    #[test]
    fn forget_drops_subscription_and_cursor() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("s1");
        reg.record_revision("s1", 1);
        reg.forget("s1");
        assert!(!reg.is_subscribed("s1"));
        assert_eq!(reg.cursor("s1"), None);
    }
}
