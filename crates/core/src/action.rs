//! Action types for the deterministic state machine.

use crate::{
    message::{OutboundMessage, OutboundRequest},
    Destination, Event, RequestId, TimerId,
};
use gridmesh_messages::RequestOutcome;
use gridmesh_types::{DeviceCommand, UnitId};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Publish a message on its broadcast address.
    ///
    /// Delivered to every unit in the cluster, the sender included. Local
    /// delivery to the sender is immediate; remote delivery is subject to
    /// network latency and loss.
    Broadcast { message: OutboundMessage },

    /// Send a message point-to-point to one unit, no reply expected.
    Send {
        to: UnitId,
        message: OutboundMessage,
    },

    /// Send a request and expect exactly one reply.
    ///
    /// The runner correlates the reply (or timeout, or routing failure)
    /// back to the machine as `Event::ReplyReceived` with the same
    /// `request_id`. The request's logical address comes from its type;
    /// `to` picks the process that serves it.
    Request {
        to: Destination,
        request: OutboundRequest,
        request_id: RequestId,
        timeout: Duration,
    },

    /// Answer an incoming request.
    Reply {
        request_id: RequestId,
        outcome: RequestOutcome,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration.
    ///
    /// Setting a timer that is already pending reschedules it.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    ///
    /// Internal events are processed at the same timestamp with higher
    /// priority than external events, preserving causality.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Execute a command on the local device.
    ///
    /// Delegated to the device adapter in production, instant in
    /// simulation. Returns `Event::DeviceCommandCompleted` carrying the
    /// same `request_id` when complete.
    ExecuteDeviceCommand {
        /// Correlates the completion callback. Incoming requests pass
        /// their inbound id so the completion can be answered; a machine
        /// running its own command passes an id from its scoped
        /// allocator; `None` is fire-and-forget.
        request_id: Option<RequestId>,
        command: DeviceCommand,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Process Control
    // ═══════════════════════════════════════════════════════════════════════
    /// Stop processing: the unit process must exit.
    ///
    /// With `restart` the supervisor is expected to start a fresh process
    /// with empty state; without it the unit stays down.
    Halt {
        restart: bool,
        reasons: Vec<String>,
    },
}

impl Action {
    /// Check if this action produces network I/O.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Action::Broadcast { .. }
                | Action::Send { .. }
                | Action::Request { .. }
                | Action::Reply { .. }
        )
    }

    /// Check if this action is delegated work (returns a callback event).
    pub fn is_delegated(&self) -> bool {
        matches!(self, Action::ExecuteDeviceCommand { .. })
    }

    /// Check if this is an internal event action.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }

    /// Check if this action stops the unit process.
    pub fn is_halt(&self) -> bool {
        matches!(self, Action::Halt { .. })
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            // Network
            Action::Broadcast { .. } => "Broadcast",
            Action::Send { .. } => "Send",
            Action::Request { .. } => "Request",
            Action::Reply { .. } => "Reply",

            // Timers
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",

            // Internal
            Action::EnqueueInternal { .. } => "EnqueueInternal",

            // Delegated Work
            Action::ExecuteDeviceCommand { .. } => "ExecuteDeviceCommand",

            // Process Control
            Action::Halt { .. } => "Halt",
        }
    }
}
