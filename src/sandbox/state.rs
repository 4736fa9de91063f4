//! Lifecycle of one sandbox instance.
//!
//! ```text
//!            boot signal               dispatched
//! Starting ─────────────► Ready ◄──────────────► Busy
//!    │  ▲                   │     terminal status  │
//!    │  │ respawn           │ exit                 │ exit / timeout
//!    │  │                   ▼                      │
//!    └──┴──────────────► Crashed ◄─────────────────┘
//!   boot timeout            │ restarts exhausted
//!                           ▼
//!       (any) ── shutdown ─► Stopped
//! ```
//!
//! The machine is a pure function over `(state, event)`; the supervisor in
//! `instance.rs` owns the side effects.

use std::fmt;
use std::time::Duration;

/// State of one sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Process launched, waiting for its boot signal.
    Starting,
    /// Idle and accepting a job.
    Ready,
    /// Running exactly one job.
    Busy,
    /// Process gone; waiting to be respawned.
    Crashed,
    /// Terminal. Accepts no further transitions.
    Stopped,
}

/// Something that happened to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
    /// The runtime reported it is ready.
    BootSignal,
    /// The runtime failed to report readiness in time.
    BootTimeout,
    /// A job was handed to the instance.
    Dispatched,
    /// The running job's terminal status was delivered.
    TerminalBuffered,
    /// The running job exceeded its budget and the process was killed.
    ExecutionTimedOut,
    /// The process exited without being asked to.
    ProcessExited,
    /// A respawn was triggered.
    Respawn,
    /// The restart budget ran out.
    RestartsExhausted,
    /// Explicit shutdown.
    Shutdown,
}

/// A transition the machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid instance transition: {event:?} while {from}")]
pub struct InvalidTransition {
    /// State the event arrived in.
    pub from: InstanceState,
    /// The rejected event.
    pub event: InstanceEvent,
}

impl InstanceState {
    /// Applies `event`, returning the next state.
    pub fn on(self, event: InstanceEvent) -> Result<Self, InvalidTransition> {
        use InstanceEvent as E;
        use InstanceState as S;

        let next = match (self, event) {
            (S::Stopped, _) => None,
            (_, E::Shutdown) => Some(S::Stopped),
            (S::Starting, E::BootSignal) => Some(S::Ready),
            (S::Starting, E::BootTimeout | E::ProcessExited) => Some(S::Crashed),
            (S::Ready, E::Dispatched) => Some(S::Busy),
            (S::Ready, E::ProcessExited) => Some(S::Crashed),
            (S::Busy, E::TerminalBuffered) => Some(S::Ready),
            (S::Busy, E::ProcessExited | E::ExecutionTimedOut) => Some(S::Crashed),
            (S::Crashed, E::Respawn) => Some(S::Starting),
            (S::Crashed, E::RestartsExhausted) => Some(S::Stopped),
            _ => None,
        };

        next.ok_or(InvalidTransition { from: self, event })
    }

    /// Returns true for `Stopped`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Crashed => write!(f, "crashed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Bounded restart budget for one instance.
///
/// Consecutive failed boots or crashes consume the budget; a successful boot
/// refills it.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_restarts: u32,
    delay: Duration,
    used: u32,
}

impl RestartPolicy {
    /// A full budget of `max_restarts`, each preceded by `delay`.
    pub fn new(max_restarts: u32, delay: Duration) -> Self {
        Self {
            max_restarts,
            delay,
            used: 0,
        }
    }

    /// Claims one restart. Returns the delay to wait, or `None` when exhausted.
    pub fn next_restart(&mut self) -> Option<Duration> {
        if self.used >= self.max_restarts {
            return None;
        }
        self.used += 1;
        Some(self.delay)
    }

    /// Refills the budget after a successful boot.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Restarts consumed since the last successful boot.
    pub fn used(&self) -> u32 {
        self.used
    }
}
