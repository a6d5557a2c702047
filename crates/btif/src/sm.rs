//! Generic state machine engine for profile state machines.
//!
//! A machine holds its current state and a handler that matches on `(state, event)`.
//! Transitions fire `Exit` against the old state and `Enter` against the new one.
//!
//! Asymmetries callers rely on:
//! - `init` does not fire `Enter` for the initial state.
//! - `shutdown` does not fire `Exit` for the current state.
//!
//! A handler may request further transitions from inside any callback (including its own
//! `Enter`/`Exit` processing) through the [`Transitions`] it is handed. Requests are applied
//! in order once the running callback returns. The engine does not detect transition loops.

use std::collections::VecDeque;
use std::fmt;

/// Raw id of the synthetic enter event, reserved at the top of a u16 event space.
pub const SM_ENTER_EVT: u16 = 0xFFFF;
/// Raw id of the synthetic exit event.
pub const SM_EXIT_EVT: u16 = 0xFFFE;

/// Event delivered to a state handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmEvent<E> {
    Enter,
    Exit,
    Event(E),
}

impl SmEvent<u16> {
    /// Map a raw u16 event id, treating the reserved ids as the pseudo-events.
    pub fn from_id(id: u16) -> Self {
        match id {
            SM_ENTER_EVT => SmEvent::Enter,
            SM_EXIT_EVT => SmEvent::Exit,
            other => SmEvent::Event(other),
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            SmEvent::Enter => SM_ENTER_EVT,
            SmEvent::Exit => SM_EXIT_EVT,
            SmEvent::Event(id) => *id,
        }
    }
}

/// Transition requests collected while a handler runs.
#[derive(Debug)]
pub struct Transitions<S> {
    pending: VecDeque<S>,
}

impl<S> Transitions<S> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Request a transition to `state` once the current callback returns.
    pub fn change_state(&mut self, state: S) {
        self.pending.push_back(state);
    }
}

/// Per-state behaviour of a machine.
///
/// Implementations match exhaustively on their state enum, so every reachable state has a
/// handler by construction.
pub trait StateHandler {
    type State: Copy + Eq + fmt::Debug;
    type Event;

    /// Handle `event` in `state`. The return value tells the caller whether the event was
    /// consumed; the engine itself does not act on it.
    fn handle(
        &mut self,
        state: Self::State,
        event: SmEvent<Self::Event>,
        transitions: &mut Transitions<Self::State>,
    ) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SmError {
    #[error("state machine has been shut down")]
    NotRunning,
}

pub struct StateMachine<H: StateHandler> {
    state: H::State,
    handler: Option<H>,
}

impl<H: StateHandler> StateMachine<H> {
    /// Create a machine in `initial`. No `Enter` is fired.
    pub fn init(handler: H, initial: H::State) -> Self {
        tracing::trace!(state = ?initial, "State machine initialised");
        Self {
            state: initial,
            handler: Some(handler),
        }
    }

    /// Deliver `event` to the handler of the current state.
    ///
    /// `Ok` only says the machine was running; whether the handler consumed the event is
    /// not reported.
    pub fn dispatch(&mut self, event: H::Event) -> Result<(), SmError> {
        self.run(SmEvent::Event(event))
    }

    /// Fire `Exit` on the current state, switch to `state`, fire `Enter` on it.
    pub fn change_state(&mut self, state: H::State) -> Result<(), SmError> {
        let handler = self.handler.as_mut().ok_or(SmError::NotRunning)?;
        let mut transitions = Transitions::new();
        transitions.change_state(state);
        Self::apply(&mut self.state, handler, &mut transitions);
        Ok(())
    }

    pub fn state(&self) -> H::State {
        self.state
    }

    pub fn handler(&self) -> Option<&H> {
        self.handler.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.handler.is_some()
    }

    /// Stop the machine and hand back its handler. No `Exit` is fired.
    pub fn shutdown(&mut self) -> Option<H> {
        tracing::trace!(state = ?self.state, "State machine shut down");
        self.handler.take()
    }

    fn run(&mut self, event: SmEvent<H::Event>) -> Result<(), SmError> {
        let handler = self.handler.as_mut().ok_or(SmError::NotRunning)?;
        let mut transitions = Transitions::new();
        handler.handle(self.state, event, &mut transitions);
        Self::apply(&mut self.state, handler, &mut transitions);
        Ok(())
    }

    fn apply(state: &mut H::State, handler: &mut H, transitions: &mut Transitions<H::State>) {
        while let Some(next) = transitions.pending.pop_front() {
            tracing::trace!(from = ?*state, to = ?next, "State transition");
            handler.handle(*state, SmEvent::Exit, transitions);
            *state = next;
            handler.handle(*state, SmEvent::Enter, transitions);
        }
    }
}

impl<H: StateHandler> fmt::Debug for StateMachine<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state)
            .field("running", &self.handler.is_some())
            .finish()
    }
}
