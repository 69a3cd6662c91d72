//! Core types for the deterministic control plane.
//!
//! This crate provides the foundational types for the event-driven
//! architecture:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait that all state machines implement
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts action results back into events

mod action;
mod event;
mod message;
mod request;
mod traits;

pub use action::Action;
pub use event::{timer_event, Event, EventPriority};
pub use message::{OutboundMessage, OutboundRequest};
pub use request::{Destination, RequestId, RequestIdAllocator, INBOUND_SCOPE};
pub use traits::{StateMachine, SubStateMachine};

/// Identifies a timer owned by the state machine.
///
/// One timer per id: setting an id that is already pending reschedules it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Dispatcher sweep (fault queues, recovery progress, sustain window)
    Sweep,
    /// Coordinator uniqueness heartbeat
    Heartbeat,
    /// Telemetry aggregation round interval
    Collection,
    /// Reply window for the open aggregation round
    RoundTimeout,
    /// Scram settle delay before stopping the voltage reference
    Settle,
    /// Re-poll interval while waiting for deals to deactivate
    StopPoll,
    /// Deadline for deals to deactivate
    StopDeadline,
}
