use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::PwshInvokeError;

/// State of a command invocation, mirroring the lifecycle of the underlying
/// pipeline it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsInvocationState {
    NotStarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Completed = 4,
    Failed = 5,
    Disconnected = 6,
}

impl PsInvocationState {
    /// Terminal states absorb every later transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Disconnected => "Disconnected",
        }
    }
}

/// Immutable `(state, optional failure reason)` pair. Subscribers always get
/// their own clone so the live instance can never be observed mid-mutation.
#[derive(Debug, Clone)]
pub struct PsInvocationStateInfo {
    pub state: PsInvocationState,
    pub reason: Option<PwshInvokeError>,
}

impl PsInvocationStateInfo {
    pub fn new(state: PsInvocationState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    pub fn with_reason(state: PsInvocationState, reason: PwshInvokeError) -> Self {
        Self {
            state,
            reason: Some(reason),
        }
    }
}

pub type StateChangedHandler = Arc<dyn Fn(&PsInvocationStateInfo) + Send + Sync>;

/// Owns the invocation state for one instance and enforces legal transitions.
///
/// The mutex in here guards the state field only. Subscriber dispatch never
/// happens under it, so handler code is free to call back into the owning
/// instance (including requesting a stop) without deadlocking.
pub struct InvocationStateMachine {
    info: Mutex<PsInvocationStateInfo>,
    subscribers: Mutex<Vec<StateChangedHandler>>,
}

impl InvocationStateMachine {
    pub fn new() -> Self {
        Self::starting_at(PsInvocationState::NotStarted)
    }

    pub(crate) fn starting_at(state: PsInvocationState) -> Self {
        Self {
            info: Mutex::new(PsInvocationStateInfo::new(state)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> PsInvocationStateInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn subscribe(&self, handler: StateChangedHandler) {
        self.subscribers.lock().unwrap().push(handler);
    }

    /// Re-arm a terminal instance so it can be invoked again. No event is
    /// emitted; this is bookkeeping, not a state change anyone observes.
    pub(crate) fn reset_for_restart(&self) {
        let mut info = self.info.lock().unwrap();
        if info.state.is_terminal() {
            *info = PsInvocationStateInfo::new(PsInvocationState::NotStarted);
        }
    }

    /// Apply the transition rules and, if the transition is accepted, record
    /// the new state. Returns `(previous, applied)` on success; `None` means
    /// the incoming notification was dropped (or coerced away) and nothing
    /// observable changed.
    ///
    /// A `Completed`/`Failed` arriving while `Stopping` is coerced to
    /// `Stopped`: a command that finishes naturally after a stop was
    /// requested is reported as stopped. Any failure reason is preserved.
    pub(crate) fn request_transition(
        &self,
        incoming: PsInvocationStateInfo,
    ) -> Option<(PsInvocationState, PsInvocationStateInfo)> {
        let mut info = self.info.lock().unwrap();
        let previous = info.state;

        if previous.is_terminal() {
            debug!(
                previous = previous.name(),
                incoming = incoming.state.name(),
                "dropping transition after terminal state"
            );
            return None;
        }

        let mut applied = incoming;
        match (previous, applied.state) {
            (PsInvocationState::Running, PsInvocationState::Running)
            | (PsInvocationState::Disconnected, PsInvocationState::Disconnected)
            | (
                PsInvocationState::Stopping,
                PsInvocationState::Running | PsInvocationState::Stopping,
            ) => return None,
            (
                PsInvocationState::Stopping,
                PsInvocationState::Completed | PsInvocationState::Failed,
            ) => {
                applied.state = PsInvocationState::Stopped;
            }
            _ => {}
        }

        debug!(
            previous = previous.name(),
            next = applied.state.name(),
            "invocation state transition"
        );
        *info = applied.clone();
        Some((previous, applied))
    }

    /// Emit a state snapshot to every subscriber, outside any lock.
    pub(crate) fn dispatch(&self, info: &PsInvocationStateInfo) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            subscriber(info);
        }
    }
}

impl Default for InvocationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
