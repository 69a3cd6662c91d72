//! State machine traits.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous state machine.
///
/// The machine owns all protocol state for one unit. It performs no I/O,
/// reads no clock, and uses no randomness: time only advances when the
/// runner calls [`set_time`](StateMachine::set_time), and the outside
/// world only changes through the returned [`Action`]s.
///
/// Determinism contract: the same sequence of `set_time` and `handle`
/// calls produces the same actions, byte for byte.
pub trait StateMachine {
    /// Process one event and return the actions it caused.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Advance the machine's notion of now.
    ///
    /// The runner calls this before delivering each event. `now` never
    /// decreases.
    fn set_time(&mut self, now: Duration);

    /// The machine's current notion of now.
    fn now(&self) -> Duration;
}

/// A component machine composed into a unit's [`StateMachine`].
///
/// Sub-machines claim the events they own: `try_handle` returns `None`
/// for events it does not recognize so the composition root can offer
/// them to the next machine in the chain.
pub trait SubStateMachine {
    /// Handle the event if this machine owns it.
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>>;

    /// Advance this machine's notion of now.
    fn set_time(&mut self, now: Duration);
}
