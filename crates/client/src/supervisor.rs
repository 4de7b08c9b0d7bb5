//! Connection supervisor: a pure state machine for connect / retry / give up.
//!
//! The engine drives it: `begin_attempt` before dialing, then exactly one of
//! `connect_failed` / `connected` for that attempt's generation. Generations
//! let the engine drop late results from a connection it already replaced.

use std::time::Duration;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until `restart`.
    GaveUp,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// What the engine should do after reporting an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Retry(Duration),
    GaveUp,
    /// Outcome belonged to a superseded attempt.
    Ignore,
}

#[derive(Debug)]
pub struct Supervisor {
    policy: ReconnectPolicy,
    state: ConnectionState,
    failures: u32,
    generation: u64,
}

impl Supervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            failures: 0,
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Start a connect attempt. Only valid from `Disconnected`.
    pub fn begin_attempt(&mut self) -> Option<u64> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        info!(
            component = "supervisor",
            event = "supervisor.connect.attempt",
            generation = self.generation,
            attempt = self.failures + 1,
            max_attempts = self.policy.max_attempts,
            "Connecting"
        );
        Some(self.generation)
    }

    /// The attempt failed before it was confirmed healthy.
    pub fn connect_failed(&mut self, generation: u64) -> NextStep {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return NextStep::Ignore;
        }
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.state = ConnectionState::GaveUp;
            warn!(
                component = "supervisor",
                event = "supervisor.gave_up",
                failures = self.failures,
                "Giving up after repeated connect failures"
            );
            return NextStep::GaveUp;
        }
        self.state = ConnectionState::Disconnected;
        let delay = self.policy.delay_after(self.failures);
        info!(
            component = "supervisor",
            event = "supervisor.connect.retry_scheduled",
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Connect failed, retry scheduled"
        );
        NextStep::Retry(delay)
    }

    /// The attempt opened and passed the liveness probe.
    pub fn connected(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.failures = 0;
        info!(
            component = "supervisor",
            event = "supervisor.connected",
            generation,
            "Connection confirmed healthy"
        );
        true
    }

    /// The receive loop of a live connection ended.
    pub fn receive_failed(&mut self, generation: u64) -> NextStep {
        if generation != self.generation || self.state != ConnectionState::Connected {
            return NextStep::Ignore;
        }
        self.state = ConnectionState::Disconnected;
        self.failures = 0;
        warn!(
            component = "supervisor",
            event = "supervisor.connection.lost",
            generation,
            "Connection lost, reconnecting"
        );
        NextStep::Retry(self.policy.delay_after(1))
    }

    /// Explicit user restart: forget failures, leave `GaveUp`, invalidate
    /// any attempt still in flight.
    pub fn restart(&mut self) {
        self.generation += 1;
        self.failures = 0;
        self.state = ConnectionState::Disconnected;
        info!(
            component = "supervisor",
            event = "supervisor.restart",
            generation = self.generation,
            "Connection restart requested"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(4), Duration::from_millis(800));
        assert_eq!(p.delay_after(5), Duration::from_millis(1000));
        assert_eq!(p.delay_after(60), Duration::from_millis(1000));
    }

    #[test]
    fn gives_up_after_exactly_max_attempts() {
        let mut sup = Supervisor::new(policy(3));

        for expected in 1..3u32 {
            let gen = sup.begin_attempt().expect("attempt allowed");
            assert_eq!(sup.state(), ConnectionState::Connecting);
            assert!(matches!(sup.connect_failed(gen), NextStep::Retry(_)));
            assert_eq!(sup.failures(), expected);
            assert_eq!(sup.state(), ConnectionState::Disconnected);
        }

        let gen = sup.begin_attempt().expect("third attempt allowed");
        assert_eq!(sup.connect_failed(gen), NextStep::GaveUp);
        assert_eq!(sup.state(), ConnectionState::GaveUp);
        assert_eq!(sup.begin_attempt(), None);
    }

    #[test]
    fn restart_resets_counter_after_giving_up() {
        let mut sup = Supervisor::new(policy(1));
        let gen = sup.begin_attempt().expect("attempt");
        assert_eq!(sup.connect_failed(gen), NextStep::GaveUp);

        sup.restart();
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(sup.failures(), 0);
        assert!(sup.begin_attempt().is_some());
    }

    #[test]
    fn connected_requires_matching_generation() {
        let mut sup = Supervisor::new(policy(5));
        let gen = sup.begin_attempt().expect("attempt");
        assert!(!sup.connected(gen + 1));
        assert!(sup.connected(gen));
        assert_eq!(sup.state(), ConnectionState::Connected);
    }

    #[test]
    fn healthy_connection_resets_failures() {
        let mut sup = Supervisor::new(policy(5));
        let gen = sup.begin_attempt().expect("attempt");
        sup.connect_failed(gen);
        assert_eq!(sup.failures(), 1);
        let gen = sup.begin_attempt().expect("attempt");
        assert!(sup.connected(gen));
        assert_eq!(sup.failures(), 0);
    }

    #[test]
    fn receive_failure_from_stale_generation_is_ignored() {
        let mut sup = Supervisor::new(policy(5));
        let old = sup.begin_attempt().expect("attempt");
        assert!(sup.connected(old));
        assert!(matches!(sup.receive_failed(old), NextStep::Retry(_)));

        let new = sup.begin_attempt().expect("attempt");
        assert!(sup.connected(new));
        assert_eq!(sup.receive_failed(old), NextStep::Ignore);
        assert_eq!(sup.state(), ConnectionState::Connected);
    }

    #[test]
    fn restart_invalidates_in_flight_attempt() {
        let mut sup = Supervisor::new(policy(5));
        let gen = sup.begin_attempt().expect("attempt");
        sup.restart();
        assert!(!sup.connected(gen));
        assert_eq!(sup.connect_failed(gen), NextStep::Ignore);
    }
}
