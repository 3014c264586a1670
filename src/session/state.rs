//! Acquisition session lifecycle.
//!
//! ```text
//!                        resume <- Paused <- pause
//!                          |                   ^
//!                          v                   |
//!  configure ──> New ──start──> Running ───────+──stop──> Stopped
//!                 ^       ^                                  │
//!                 │       +────────────── start ─────────────+
//!                 +───────────────────── reconfigure ────────+
//!
//!  any ──fault──> Error ──reconfigure──> New
//! ```
//!
//! `reconfigure` is also accepted from Running and Paused (it stops the producers first).
//! Every pair not drawn above is rejected with `DaqError::InvalidTransition` and leaves
//! the state untouched.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::watch;

/// Session execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Configured, log destination ready, nothing recorded yet
    New,
    /// Producers running and their records reaching the log
    Running,
    /// Producers running, submissions suppressed
    Paused,
    /// Producers stopped, log closed
    Stopped,
    /// A fatal fault occurred; only `reconfigure` leaves this state
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::New => write!(f, "New"),
            SessionState::Running => write!(f, "Running"),
            SessionState::Paused => write!(f, "Paused"),
            SessionState::Stopped => write!(f, "Stopped"),
            SessionState::Error => write!(f, "Error"),
        }
    }
}

impl SessionState {
    /// Whether producer records should currently reach the log.
    pub fn is_recording(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// Whether producer tasks are alive in this state. Producers exit as soon as
    /// they observe any other state.
    pub fn has_producers(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Paused)
    }

    /// Resulting state for `event`, or `None` if the pair is not defined.
    pub fn next(&self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::New | S::Stopped, E::Start) => Some(S::Running),
            (S::Running, E::Pause) => Some(S::Paused),
            (S::Paused, E::Resume) => Some(S::Running),
            (S::Running | S::Paused, E::Stop) => Some(S::Stopped),
            (S::New | S::Running | S::Paused | S::Stopped | S::Error, E::Reconfigure) => {
                Some(S::New)
            }
            (_, E::Fault) => Some(S::Error),
            _ => None,
        }
    }
}

/// Control events driving the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Begin or restart acquisition
    Start,
    /// Suspend logging, keep producers alive
    Pause,
    /// Continue logging after a pause
    Resume,
    /// End the run, join producers and close the log
    Stop,
    /// Discard the configuration and return to New
    Reconfigure,
    /// Fatal fault reported by a producer or a control operation
    Fault,
}

impl SessionEvent {
    /// Every event, in table order.
    pub const ALL: [SessionEvent; 6] = [
        SessionEvent::Start,
        SessionEvent::Pause,
        SessionEvent::Resume,
        SessionEvent::Stop,
        SessionEvent::Reconfigure,
        SessionEvent::Fault,
    ];
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionEvent::Start => "start",
            SessionEvent::Pause => "pause",
            SessionEvent::Resume => "resume",
            SessionEvent::Stop => "stop",
            SessionEvent::Reconfigure => "reconfigure",
            SessionEvent::Fault => "fault",
        };
        write!(f, "{}", label)
    }
}

/// What producers see of the session: the state plus the shared time reference.
///
/// Published through a `tokio::sync::watch` channel; only the session writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current state
    pub state: SessionState,
    /// Set on the first New -> Running of a configuration, cleared by reconfigure
    pub time_zero: Option<Instant>,
}

impl SessionSnapshot {
    /// Microseconds elapsed since `time_zero` at `at`, or 0 when unset.
    pub fn host_time_us(&self, at: Instant) -> u64 {
        self.time_zero
            .map(|t0| at.saturating_duration_since(t0).as_micros() as u64)
            .unwrap_or(0)
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::New,
            time_zero: None,
        }
    }
}

/// Reason the producers were halted, set by the first producer that failed.
pub type HaltReason = Option<String>;

/// Everything a producer consults before sampling and before submitting.
///
/// Combines the session snapshot with the orchestrator's halt flag. The flag is raised as
/// soon as any producer fails, so its siblings stop without waiting for the session to
/// apply the fault.
#[derive(Debug, Clone)]
pub struct ProducerGate {
    session: watch::Receiver<SessionSnapshot>,
    halt: watch::Receiver<HaltReason>,
}

impl ProducerGate {
    /// Gate over a session snapshot channel and a halt channel.
    pub fn new(
        session: watch::Receiver<SessionSnapshot>,
        halt: watch::Receiver<HaltReason>,
    ) -> Self {
        Self { session, halt }
    }

    /// Whether the producer should take another sample.
    pub fn is_open(&self) -> bool {
        self.halt.borrow().is_none() && self.session.borrow().state.has_producers()
    }

    /// Snapshot to stamp a record with, or `None` when records must not reach the log.
    pub fn recording(&self) -> Option<SessionSnapshot> {
        if self.halt.borrow().is_some() {
            return None;
        }
        let snapshot = *self.session.borrow();
        snapshot.state.is_recording().then_some(snapshot)
    }

    /// Resolves when the state or the halt flag changes. Cancel safe.
    ///
    /// Fails once either sender is gone.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        tokio::select! {
            changed = self.session.changed() => changed,
            changed = self.halt.changed() => changed,
        }
    }
}
