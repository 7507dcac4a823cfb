//! Connection lifecycle and reconnect policy. Pure state: every transition
//! returns the side effects the host must carry out.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    ReconnectScheduled,
    /// Terminal until the process restarts.
    ReconnectExhausted,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    Connect,
    AnnounceOnline,
    StartHeartbeat,
    StopHeartbeat,
    ArmReconnectTimer,
    CancelReconnectTimer,
    FailActiveTransfer,
}

/// Delay between reconnect timer firings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed(DEFAULT_RECONNECT_INTERVAL)
    }
}

impl BackoffPolicy {
    /// Delay before the timer fires for attempt number `attempt` (0-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(d) => d,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }

    /// `delay` with ±10% jitter for the exponential policy. Fixed delays are returned as is.
    pub fn jittered<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let d = self.delay(attempt);
        match self {
            BackoffPolicy::Fixed(_) => d,
            BackoffPolicy::Exponential { .. } => d.mul_f64(rng.gen_range(0.9..=1.1)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    state: ConnState,
    attempts: u32,
    max_attempts: u32,
    timer_armed: bool,
    policy: BackoffPolicy,
}

impl Connection {
    pub fn new(max_attempts: u32, policy: BackoffPolicy) -> Self {
        Self {
            state: ConnState::Idle,
            attempts: 0,
            max_attempts,
            timer_armed: false,
            policy,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Reconnect attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    /// Idle -> Connecting.
    pub fn start(&mut self) -> Vec<ConnAction> {
        if self.state != ConnState::Idle {
            return Vec::new();
        }
        self.enter(ConnState::Connecting);
        vec![ConnAction::Connect]
    }

    /// Transport reported connected. Accepted from any non-terminal state.
    pub fn on_connected(&mut self) -> Vec<ConnAction> {
        match self.state {
            ConnState::Connected | ConnState::ReconnectExhausted => return Vec::new(),
            _ => {}
        }
        self.enter(ConnState::Connected);
        self.attempts = 0;
        let mut actions = Vec::with_capacity(3);
        if self.timer_armed {
            self.timer_armed = false;
            actions.push(ConnAction::CancelReconnectTimer);
        }
        actions.push(ConnAction::StartHeartbeat);
        actions.push(ConnAction::AnnounceOnline);
        actions
    }

    /// Transport lost, close frame received or a connect attempt failed.
    pub fn on_disconnected(&mut self) -> Vec<ConnAction> {
        match self.state {
            ConnState::Connected => {
                self.enter(ConnState::Disconnected);
                let mut actions = vec![ConnAction::StopHeartbeat, ConnAction::FailActiveTransfer];
                actions.extend(self.schedule());
                actions
            }
            ConnState::Connecting | ConnState::Disconnected => self.schedule(),
            ConnState::Idle | ConnState::ReconnectScheduled | ConnState::ReconnectExhausted => {
                Vec::new()
            }
        }
    }

    /// Reconnect timer fired. Each firing counts as one attempt and requests a
    /// connect unless the transport is already connected. A firing while an
    /// attempt is still in flight is skipped and not counted.
    pub fn on_reconnect_timer(&mut self, transport_connected: bool) -> Vec<ConnAction> {
        if !self.timer_armed {
            return Vec::new();
        }
        match self.state {
            ConnState::ReconnectScheduled => {}
            ConnState::Connecting => {
                debug!(attempt = self.attempts, "reconnect tick while connecting");
                return Vec::new();
            }
            _ => return Vec::new(),
        }
        if self.attempts >= self.max_attempts {
            warn!(attempts = self.attempts, "reconnect attempts exhausted");
            self.enter(ConnState::ReconnectExhausted);
            self.timer_armed = false;
            return vec![ConnAction::CancelReconnectTimer];
        }
        self.attempts += 1;
        if transport_connected {
            debug!(attempt = self.attempts, "reconnect tick skipped");
            return Vec::new();
        }
        info!(attempt = self.attempts, max = self.max_attempts, "reconnecting");
        self.enter(ConnState::Connecting);
        vec![ConnAction::Connect]
    }

    fn schedule(&mut self) -> Vec<ConnAction> {
        self.enter(ConnState::ReconnectScheduled);
        if self.timer_armed {
            return Vec::new();
        }
        self.timer_armed = true;
        vec![ConnAction::ArmReconnectTimer]
    }

    fn enter(&mut self, next: ConnState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "connection state");
            self.state = next;
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn connect_then_lose() {
        let mut c = Connection::default();
        assert_eq!(c.start(), vec![ConnAction::Connect]);
        assert_eq!(c.state(), ConnState::Connecting);
        assert_eq!(
            c.on_connected(),
            vec![ConnAction::StartHeartbeat, ConnAction::AnnounceOnline]
        );
        assert_eq!(
            c.on_disconnected(),
            vec![
                ConnAction::StopHeartbeat,
                ConnAction::FailActiveTransfer,
                ConnAction::ArmReconnectTimer
            ]
        );
        assert_eq!(c.state(), ConnState::ReconnectScheduled);
        assert!(c.timer_armed());
    }

    #[test]
    fn reconnect_resets_counter_and_cancels_timer() {
        let mut c = Connection::default();
        c.start();
        c.on_connected();
        c.on_disconnected();
        assert_eq!(c.on_reconnect_timer(false), vec![ConnAction::Connect]);
        c.on_disconnected();
        assert_eq!(c.on_reconnect_timer(false), vec![ConnAction::Connect]);
        assert_eq!(c.attempts(), 2);
        assert_eq!(
            c.on_connected(),
            vec![
                ConnAction::CancelReconnectTimer,
                ConnAction::StartHeartbeat,
                ConnAction::AnnounceOnline
            ]
        );
        assert_eq!(c.attempts(), 0);
        assert!(!c.timer_armed());
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut c = Connection::new(3, BackoffPolicy::default());
        c.start();
        c.on_disconnected();
        let mut last = 0;
        for _ in 0..3 {
            assert_eq!(c.on_reconnect_timer(false), vec![ConnAction::Connect]);
            assert!(c.attempts() > last);
            last = c.attempts();
            c.on_disconnected();
        }
        assert_eq!(
            c.on_reconnect_timer(false),
            vec![ConnAction::CancelReconnectTimer]
        );
        assert_eq!(c.state(), ConnState::ReconnectExhausted);
        assert!(c.attempts() <= c.max_attempts());
        for _ in 0..5 {
            assert!(c.on_reconnect_timer(false).is_empty());
            assert!(c.on_disconnected().is_empty());
        }
        assert!(c.on_connected().is_empty());
        assert_eq!(c.state(), ConnState::ReconnectExhausted);
    }

    #[test]
    fn tick_while_attempt_in_flight_is_not_counted() {
        let mut c = Connection::default();
        c.start();
        c.on_disconnected();
        assert_eq!(c.on_reconnect_timer(false), vec![ConnAction::Connect]);
        assert!(c.on_reconnect_timer(false).is_empty());
        assert_eq!(c.attempts(), 1);
        assert_eq!(c.state(), ConnState::Connecting);
    }

    #[test]
    fn slow_connects_still_get_every_attempt() {
        let max = 10;
        let mut c = Connection::new(max, BackoffPolicy::default());
        c.start();
        c.on_disconnected();
        let mut connects = 0;
        for _ in 0..4 * max {
            if c.on_reconnect_timer(false) == vec![ConnAction::Connect] {
                connects += 1;
                // Connect outlives one period, then fails.
                assert!(c.on_reconnect_timer(false).is_empty());
                c.on_disconnected();
            }
        }
        assert_eq!(connects, max);
        assert_eq!(c.state(), ConnState::ReconnectExhausted);
    }

    #[test]
    fn tick_is_noop_when_transport_already_up() {
        let mut c = Connection::default();
        c.start();
        c.on_disconnected();
        assert!(c.on_reconnect_timer(true).is_empty());
        assert_eq!(c.state(), ConnState::ReconnectScheduled);
    }

    #[test]
    fn failed_connect_does_not_rearm() {
        let mut c = Connection::default();
        c.start();
        assert_eq!(c.on_disconnected(), vec![ConnAction::ArmReconnectTimer]);
        c.on_reconnect_timer(false);
        assert!(c.on_disconnected().is_empty());
        assert_eq!(c.state(), ConnState::ReconnectScheduled);
    }

    #[test]
    fn backoff_delays() {
        let fixed = BackoffPolicy::default();
        assert_eq!(fixed.delay(7), Duration::from_secs(5));
        let exp = BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(exp.delay(0), Duration::from_secs(1));
        assert_eq!(exp.delay(3), Duration::from_secs(8));
        assert_eq!(exp.delay(10), Duration::from_secs(30));
        assert_eq!(exp.delay(40), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..6 {
            let d = exp.jittered(attempt, &mut rng);
            let base = exp.delay(attempt);
            assert!(d >= base.mul_f64(0.9) && d <= base.mul_f64(1.1));
        }
        assert_eq!(fixed.jittered(2, &mut rng), Duration::from_secs(5));
    }
}
