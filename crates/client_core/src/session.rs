use std::time::Duration;

/// Tunables for the socket lifecycle. Delays are fixed, not exponential;
/// the server sheds load by capping reconnect attempts instead.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub auth_ack_timeout: Duration,
    pub retry_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_ack_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Closed,
}

/// What the connection loop should do after a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    None,
    Reconnect { after: Duration },
    Close,
}

/// Socket lifecycle state, driven entirely by events. Each connection
/// attempt carries a generation number; a callback from a previous
/// attempt (a late timeout, a drop on a socket already replaced) carries
/// a stale generation and is ignored rather than corrupting the state of
/// the current attempt.
#[derive(Debug)]
pub struct SessionStateMachine {
    config: SessionConfig,
    phase: SessionPhase,
    generation: u64,
    attempts: u32,
}

impl SessionStateMachine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            phase: SessionPhase::Idle,
            generation: 0,
            attempts: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts a new connection attempt and returns its generation.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.phase = SessionPhase::Connecting;
        self.generation
    }

    pub fn socket_opened(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.phase == SessionPhase::Closed {
            return false;
        }
        self.phase = SessionPhase::Authenticating;
        true
    }

    pub fn authenticated(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.phase == SessionPhase::Closed {
            return false;
        }
        self.phase = SessionPhase::Connected;
        self.attempts = 0;
        true
    }

    /// Handshake never completed within the deadline. Handled like a
    /// rejection: retry on the fixed delay, outside the reconnect budget.
    pub fn auth_timed_out(&mut self, generation: u64) -> Directive {
        self.auth_rejected(generation)
    }

    /// The server refused or never acknowledged the handshake. Retries on
    /// the fixed delay without touching the reconnect budget; at page load
    /// the credential may simply not exist yet, and the failure resolves
    /// itself once a token shows up.
    pub fn auth_rejected(&mut self, generation: u64) -> Directive {
        if generation != self.generation || self.phase == SessionPhase::Closed {
            return Directive::None;
        }
        self.phase = SessionPhase::Connecting;
        Directive::Reconnect {
            after: self.config.retry_delay,
        }
    }

    /// The socket went away. Recoverable drops retry after a fixed delay
    /// until the attempt budget is spent; an unrecoverable drop (a close
    /// requested by this side) ends the session immediately.
    pub fn dropped(&mut self, generation: u64, recoverable: bool) -> Directive {
        if generation != self.generation || self.phase == SessionPhase::Closed {
            return Directive::None;
        }
        if recoverable && self.attempts < self.config.max_reconnect_attempts {
            self.attempts += 1;
            self.phase = SessionPhase::Connecting;
            return Directive::Reconnect {
                after: self.config.retry_delay,
            };
        }
        self.phase = SessionPhase::Closed;
        Directive::Close
    }

    /// Terminal stop requested by the owner. Bumps the generation so any
    /// in-flight callback from the old attempt goes stale.
    pub fn shutdown(&mut self) {
        self.generation += 1;
        self.phase = SessionPhase::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            auth_ack_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(100),
            max_reconnect_attempts: 2,
        }
    }

    #[test]
    fn happy_path_reaches_connected() {
        let mut machine = SessionStateMachine::new(config());
        let generation = machine.begin();
        assert!(machine.socket_opened(generation));
        assert!(machine.authenticated(generation));
        assert_eq!(machine.phase(), SessionPhase::Connected);
    }

    #[test]
    fn auth_timeout_retries_with_a_fixed_delay() {
        let mut machine = SessionStateMachine::new(config());
        let generation = machine.begin();
        machine.socket_opened(generation);

        assert_eq!(
            machine.auth_timed_out(generation),
            Directive::Reconnect {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(machine.phase(), SessionPhase::Connecting);
    }

    #[test]
    fn handshake_rejection_retries_outside_the_budget() {
        let mut machine = SessionStateMachine::new(config());
        for _ in 0..10 {
            let generation = machine.begin();
            machine.socket_opened(generation);
            assert!(matches!(
                machine.auth_rejected(generation),
                Directive::Reconnect { .. }
            ));
        }

        // Ten rejections later a transport drop still has its full budget.
        let generation = machine.begin();
        assert!(matches!(
            machine.dropped(generation, true),
            Directive::Reconnect { .. }
        ));
    }

    #[test]
    fn reconnect_budget_is_capped() {
        let mut machine = SessionStateMachine::new(config());
        for _ in 0..2 {
            let generation = machine.begin();
            assert!(matches!(
                machine.dropped(generation, true),
                Directive::Reconnect { .. }
            ));
        }
        let generation = machine.begin();
        assert_eq!(machine.dropped(generation, true), Directive::Close);
        assert_eq!(machine.phase(), SessionPhase::Closed);
    }

    #[test]
    fn successful_auth_resets_the_budget() {
        let mut machine = SessionStateMachine::new(config());
        let generation = machine.begin();
        machine.dropped(generation, true);
        machine.dropped(machine.generation(), true);

        let generation = machine.begin();
        machine.socket_opened(generation);
        machine.authenticated(generation);

        // A later drop gets the full budget again.
        assert!(matches!(
            machine.dropped(generation, true),
            Directive::Reconnect { .. }
        ));
    }

    #[test]
    fn unrecoverable_drop_closes_immediately() {
        let mut machine = SessionStateMachine::new(config());
        let generation = machine.begin();
        machine.socket_opened(generation);
        assert_eq!(machine.dropped(generation, false), Directive::Close);
    }

    #[test]
    fn stale_generation_events_are_ignored() {
        let mut machine = SessionStateMachine::new(config());
        let old = machine.begin();
        let current = machine.begin();

        assert_eq!(machine.dropped(old, true), Directive::None);
        assert!(!machine.socket_opened(old));
        assert!(machine.socket_opened(current));
    }

    #[test]
    fn shutdown_invalidates_in_flight_callbacks() {
        let mut machine = SessionStateMachine::new(config());
        let generation = machine.begin();
        machine.socket_opened(generation);
        machine.shutdown();

        assert_eq!(machine.dropped(generation, true), Directive::None);
        assert_eq!(machine.phase(), SessionPhase::Closed);
    }
}
