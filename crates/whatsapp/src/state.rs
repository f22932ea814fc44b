//! Session state machine.
//!
//! `SessionMachine::apply` is a pure function of the current state and one
//! input; it returns the side effects for the session actor to perform.

use std::{fmt, time::Duration};

use {
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::{events::StatusEvent, pairing::PairingArtifact, supervisor::RestartPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    AwaitingPairing,
    Ready,
    Disconnected,
    Restarting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Restarting => "restarting",
        }
    }

    /// A transport handle exists and is (or is becoming) usable.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Initializing | Self::AwaitingPairing | Self::Ready)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Caller asked to start the session.
    Initialize,
    PairingCode(PairingArtifact),
    TransportReady,
    TransportDisconnected(String),
    AuthFailure(String),
    /// Unrecoverable failure: start error or a send that found the connection gone.
    Fatal(String),
    /// Supervisor should begin a restart cycle.
    RestartRequested,
    /// Cool-down elapsed.
    RestartDue,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(StatusEvent),
    /// Tear down any existing handle, then create the handle for `generation`.
    CreateTransport { generation: u64 },
    DrainQueue,
    /// Post `RestartRequested` back to the session (asynchronously).
    ScheduleRestart,
    /// Take the handle, destroy it, wait `delay`, then post `RestartDue`.
    BeginRestart { attempt: u32, delay: Duration },
    DestroyTransport,
}

#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    pairing: Option<PairingArtifact>,
    generation: u64,
    restart_attempts: u32,
    /// Latched by an auth failure; suppresses automatic restarts.
    auth_failed: bool,
    shut_down: bool,
    policy: RestartPolicy,
}

impl SessionMachine {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            state: SessionState::Uninitialized,
            pairing: None,
            generation: 0,
            restart_attempts: 0,
            auth_failed: false,
            shut_down: false,
            policy,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn pairing_artifact(&self) -> Option<&PairingArtifact> {
        self.pairing.as_ref()
    }

    /// Generation of the current (or most recent) transport handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    pub fn auth_failed(&self) -> bool {
        self.auth_failed
    }

    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        use SessionState::*;

        let from = self.state;
        let effects = match (from, input) {
            (Initializing | AwaitingPairing | Ready | Restarting, Input::Initialize) => {
                debug!(state = %from, "initialize ignored, session already running");
                Vec::new()
            },
            (Uninitialized | Disconnected, Input::Initialize) if !self.shut_down => {
                // Operator-driven start: clears any auth latch and attempt count.
                self.auth_failed = false;
                self.restart_attempts = 0;
                self.enter_initializing()
            },

            (Restarting, Input::RestartDue) => self.enter_initializing(),

            (Initializing | AwaitingPairing, Input::PairingCode(artifact)) => {
                self.enter_awaiting_pairing(artifact)
            },
            // The handle survives an auth failure; let it pair again with fresh credentials.
            (Disconnected, Input::PairingCode(artifact)) if self.auth_failed && !self.shut_down => {
                self.enter_awaiting_pairing(artifact)
            },

            (Initializing | AwaitingPairing, Input::TransportReady) => self.enter_ready(),
            (Disconnected, Input::TransportReady) if self.auth_failed && !self.shut_down => {
                self.enter_ready()
            },

            (Initializing | AwaitingPairing | Ready, Input::TransportDisconnected(reason))
            | (Initializing | AwaitingPairing | Ready, Input::Fatal(reason)) => {
                self.enter_disconnected(reason)
            },

            (Initializing | AwaitingPairing | Ready, Input::AuthFailure(reason)) => {
                self.state = Disconnected;
                self.pairing = None;
                self.auth_failed = true;
                vec![Effect::Publish(StatusEvent::AuthFailed { reason })]
            },

            (Disconnected, Input::RestartRequested) if self.restarts_allowed() => {
                let attempt = self.restart_attempts.saturating_add(1);
                if !self.policy.allows(attempt) {
                    // Giving up: release whatever handle the last attempt left behind.
                    vec![
                        Effect::Publish(StatusEvent::RestartsExhausted {
                            attempts: self.restart_attempts,
                        }),
                        Effect::DestroyTransport,
                    ]
                } else {
                    self.restart_attempts = attempt;
                    self.state = Restarting;
                    let delay = self.policy.delay_for(attempt);
                    vec![
                        Effect::Publish(StatusEvent::Restarting {
                            attempt,
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        }),
                        Effect::BeginRestart { attempt, delay },
                    ]
                }
            },

            (_, Input::Shutdown) => {
                let was_running = from != Uninitialized;
                self.state = Disconnected;
                self.pairing = None;
                self.shut_down = true;
                let mut effects = vec![Effect::DestroyTransport];
                if was_running {
                    effects.insert(
                        0,
                        Effect::Publish(StatusEvent::Disconnected {
                            reason: "shutdown".into(),
                        }),
                    );
                }
                effects
            },

            (state, input) => {
                debug!(state = %state, ?input, "input ignored in current state");
                Vec::new()
            },
        };

        if self.state != from {
            debug!(from = %from, to = %self.state, generation = self.generation, "session transition");
        }
        effects
    }

    fn enter_initializing(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.state = SessionState::Initializing;
        self.pairing = None;
        vec![
            Effect::Publish(StatusEvent::Initializing {
                generation: self.generation,
            }),
            Effect::CreateTransport {
                generation: self.generation,
            },
        ]
    }

    fn enter_awaiting_pairing(&mut self, artifact: PairingArtifact) -> Vec<Effect> {
        self.state = SessionState::AwaitingPairing;
        self.pairing = Some(artifact.clone());
        vec![Effect::Publish(StatusEvent::PairingRequested { qr: artifact })]
    }

    fn enter_ready(&mut self) -> Vec<Effect> {
        self.state = SessionState::Ready;
        self.pairing = None;
        self.restart_attempts = 0;
        self.auth_failed = false;
        vec![Effect::Publish(StatusEvent::Ready), Effect::DrainQueue]
    }

    fn restarts_allowed(&self) -> bool {
        !self.auth_failed && !self.shut_down
    }

    fn enter_disconnected(&mut self, reason: String) -> Vec<Effect> {
        self.state = SessionState::Disconnected;
        self.pairing = None;
        let mut effects = vec![Effect::Publish(StatusEvent::Disconnected { reason })];
        if self.restarts_allowed() {
            effects.push(Effect::ScheduleRestart);
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SessionMachine {
        SessionMachine::new(RestartPolicy::fixed(Duration::from_secs(3)))
    }

    fn artifact(s: &str) -> PairingArtifact {
        PairingArtifact::from_data_url(s)
    }

    #[test]
    fn initialize_starts_first_generation() {
        let mut m = machine();
        let effects = m.apply(Input::Initialize);
        assert_eq!(m.state(), SessionState::Initializing);
        assert_eq!(effects, vec![
            Effect::Publish(StatusEvent::Initializing { generation: 1 }),
            Effect::CreateTransport { generation: 1 },
        ]);
    }

    #[test]
    fn initialize_is_idempotent_while_running() {
        let mut m = machine();
        m.apply(Input::Initialize);
        assert!(m.apply(Input::Initialize).is_empty());
        m.apply(Input::PairingCode(artifact("qr")));
        assert!(m.apply(Input::Initialize).is_empty());
        m.apply(Input::TransportReady);
        assert!(m.apply(Input::Initialize).is_empty());
        assert_eq!(m.generation(), 1);
    }

    #[test]
    fn pairing_then_ready_clears_artifact_and_drains() {
        let mut m = machine();
        m.apply(Input::Initialize);
        let effects = m.apply(Input::PairingCode(artifact("qr-1")));
        assert_eq!(m.state(), SessionState::AwaitingPairing);
        assert_eq!(effects, vec![Effect::Publish(StatusEvent::PairingRequested {
            qr: artifact("qr-1")
        })]);

        m.apply(Input::PairingCode(artifact("qr-2")));
        assert_eq!(m.pairing_artifact(), Some(&artifact("qr-2")));

        let effects = m.apply(Input::TransportReady);
        assert!(m.is_ready());
        assert_eq!(m.pairing_artifact(), None);
        assert_eq!(
            effects.iter().filter(|e| **e == Effect::DrainQueue).count(),
            1
        );
    }

    #[test]
    fn ready_without_pairing_when_credentials_exist() {
        let mut m = machine();
        m.apply(Input::Initialize);
        m.apply(Input::TransportReady);
        assert!(m.is_ready());
    }

    #[test]
    fn disconnect_schedules_restart_then_cools_down() {
        let mut m = machine();
        m.apply(Input::Initialize);
        m.apply(Input::TransportReady);

        let effects = m.apply(Input::TransportDisconnected("NAVIGATION".into()));
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(!m.is_ready());
        assert_eq!(effects, vec![
            Effect::Publish(StatusEvent::Disconnected {
                reason: "NAVIGATION".into()
            }),
            Effect::ScheduleRestart,
        ]);

        let effects = m.apply(Input::RestartRequested);
        assert_eq!(m.state(), SessionState::Restarting);
        assert!(effects.contains(&Effect::BeginRestart {
            attempt: 1,
            delay: Duration::from_secs(3)
        }));

        // A second restart request while one is in flight is a no-op.
        assert!(m.apply(Input::RestartRequested).is_empty());
        assert!(m.apply(Input::Initialize).is_empty());

        let effects = m.apply(Input::RestartDue);
        assert_eq!(m.state(), SessionState::Initializing);
        assert!(effects.contains(&Effect::CreateTransport { generation: 2 }));
    }

    #[test]
    fn fatal_during_initialization_restarts() {
        let mut m = machine();
        m.apply(Input::Initialize);
        let effects = m.apply(Input::Fatal("spawn failed".into()));
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(effects.contains(&Effect::ScheduleRestart));
    }

    #[test]
    fn auth_failure_does_not_restart() {
        let mut m = machine();
        m.apply(Input::Initialize);
        m.apply(Input::PairingCode(artifact("qr")));

        let effects = m.apply(Input::AuthFailure("bad creds".into()));
        assert_eq!(effects, vec![Effect::Publish(StatusEvent::AuthFailed {
            reason: "bad creds".into()
        })]);
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(m.auth_failed());
        assert_eq!(m.pairing_artifact(), None);

        assert!(m.apply(Input::RestartRequested).is_empty());
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn auth_failed_session_can_still_pair_or_be_reinitialized() {
        let mut m = machine();
        m.apply(Input::Initialize);
        m.apply(Input::AuthFailure("rejected".into()));

        m.apply(Input::PairingCode(artifact("fresh")));
        assert_eq!(m.state(), SessionState::AwaitingPairing);
        m.apply(Input::TransportReady);
        assert!(m.is_ready());
        assert!(!m.auth_failed());

        m.apply(Input::AuthFailure("rejected again".into()));
        let effects = m.apply(Input::Initialize);
        assert!(!m.auth_failed());
        assert!(effects.contains(&Effect::CreateTransport { generation: 2 }));
    }

    #[test]
    fn plain_disconnected_ignores_transport_progress() {
        let mut m = machine();
        m.apply(Input::Initialize);
        m.apply(Input::Fatal("boom".into()));
        assert!(m.apply(Input::TransportReady).is_empty());
        assert!(m.apply(Input::PairingCode(artifact("late"))).is_empty());
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn attempts_are_bounded_when_configured() {
        let mut m = SessionMachine::new(RestartPolicy {
            max_attempts: Some(1),
            ..RestartPolicy::fixed(Duration::from_millis(10))
        });
        m.apply(Input::Initialize);
        m.apply(Input::Fatal("x".into()));
        m.apply(Input::RestartRequested);
        m.apply(Input::RestartDue);
        m.apply(Input::Fatal("x".into()));

        let effects = m.apply(Input::RestartRequested);
        assert_eq!(effects, vec![
            Effect::Publish(StatusEvent::RestartsExhausted { attempts: 1 }),
            Effect::DestroyTransport,
        ]);
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn ready_resets_attempts() {
        let mut m = machine();
        m.apply(Input::Initialize);
        m.apply(Input::Fatal("x".into()));
        m.apply(Input::RestartRequested);
        m.apply(Input::RestartDue);
        assert_eq!(m.restart_attempts(), 1);
        m.apply(Input::TransportReady);
        assert_eq!(m.restart_attempts(), 0);
    }

    #[test]
    fn shutdown_destroys_and_blocks_restart() {
        let mut m = machine();
        m.apply(Input::Initialize);
        m.apply(Input::TransportReady);
        let effects = m.apply(Input::Shutdown);
        assert_eq!(effects, vec![
            Effect::Publish(StatusEvent::Disconnected {
                reason: "shutdown".into()
            }),
            Effect::DestroyTransport,
        ]);
        assert!(m.apply(Input::RestartRequested).is_empty());
        assert!(m.apply(Input::Initialize).is_empty());
        assert!(m.apply(Input::PairingCode(artifact("late"))).is_empty());
    }
}
