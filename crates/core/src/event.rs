//! Event types for the deterministic state machine.

use crate::RequestId;
use gridmesh_messages::RequestOutcome;
use gridmesh_types::{
    DealId, DealRecord, DeviceCommand, DeviceStatus, FaultRecord, OperationMode,
    TelemetrySnapshot, UnitId, UnitTelemetry,
};
use std::time::Duration;

use crate::TimerId;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    /// Processed first to maintain causality.
    Internal = 0,

    /// Timer events: scheduled by the unit itself.
    Timer = 1,

    /// Network events: external inputs from other units.
    Network = 2,

    /// Client events: external inputs from the trading layer.
    Client = 3,
}

/// All possible events a unit can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Periodic dispatcher sweep: age fault queues, advance recovery
    /// sequences, expire the error-sustain window.
    SweepTimer,

    /// Time to publish the coordinator heartbeat (coordinator only).
    HeartbeatTimer,

    /// Time to open a new telemetry aggregation round (coordinator only).
    CollectionTimer,

    /// The current aggregation round's reply window closed.
    RoundTimeoutTimer,

    /// Scram settle delay elapsed; stop the voltage reference as well.
    SettleTimer,

    /// Re-ask the coordinator to stop still-active deals.
    StopPollTimer,

    /// Give up waiting for deals to deactivate.
    StopDeadlineTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages - Broadcasts (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// Heartbeat on the coordinator uniqueness address.
    ///
    /// `coordinator` is `None` for the query form: a unit asking the
    /// current coordinator to identify itself.
    HeartbeatReceived { coordinator: Option<UnitId> },

    /// A coordinator opened an aggregation round and wants telemetry.
    TelemetryRequested { round: u64, requester: UnitId },

    /// One unit's telemetry answer for an aggregation round.
    TelemetryReplyReceived { round: u64, telemetry: UnitTelemetry },

    /// A fault was published on the cluster-wide fault address.
    ///
    /// Every unit receives every fault, including its own.
    FaultReported { fault: FaultRecord },

    /// Emergency stop order for this unit's device.
    ScramReceived {
        exclude_voltage_reference: bool,
        reasons: Vec<String>,
    },

    /// Cluster-wide trading mode change.
    GlobalModeReceived {
        mode: OperationMode,
        reasons: Vec<String>,
    },

    /// Every unit process must shut down.
    ShutdownAllReceived { reasons: Vec<String> },

    /// Every unit process must restart with fresh state.
    ResetAllReceived { reasons: Vec<String> },

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages - Incoming Requests (priority: Network)
    // The runner allocates a RequestId per incoming request; the machine
    // answers with Action::Reply carrying the same id.
    // ═══════════════════════════════════════════════════════════════════════
    /// Another unit wants a command executed on this unit's device.
    DeviceCommandRequested {
        request_id: RequestId,
        command: DeviceCommand,
    },

    /// A caller wants the aggregated telemetry snapshot.
    CachedTelemetryRequested {
        request_id: RequestId,
        /// Oldest acceptable snapshot `taken_at`, or `None` to wait for
        /// the next completed round.
        not_older_than: Option<Duration>,
    },

    /// A caller asks whether this unit has an active fault.
    FaultQueryRequested { request_id: RequestId },

    /// This unit, as coordinator, is asked to give up the role.
    DemoteRequested {
        request_id: RequestId,
        reasons: Vec<String>,
    },

    /// This unit process is asked to shut down.
    ShutdownRequested {
        request_id: RequestId,
        reasons: Vec<String>,
    },

    /// This unit process is asked to restart with fresh state.
    ResetRequested {
        request_id: RequestId,
        reasons: Vec<String>,
    },

    /// The reply (or failure) for a request this unit sent.
    ///
    /// Exactly one `ReplyReceived` is delivered per `Action::Request`,
    /// whether the remote side answered, rejected, or the messaging layer
    /// gave up.
    ReplyReceived {
        request_id: RequestId,
        outcome: RequestOutcome,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Device Adapter Callbacks (priority: Internal)
    // Results from delegated device I/O
    // ═══════════════════════════════════════════════════════════════════════
    /// The local device reported a status change or periodic sample.
    LocalDeviceUpdated { status: DeviceStatus },

    /// A delegated device command finished.
    ///
    /// Callback from `Action::ExecuteDeviceCommand`. `request_id` is the
    /// incoming request to answer, or `None` when the command was
    /// self-initiated (scram, recovery stop).
    DeviceCommandCompleted {
        request_id: Option<RequestId>,
        result: Result<DeviceStatus, String>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// An aggregation round completed and produced a snapshot.
    ///
    /// Emitted by the aggregation service; consumed by the safety
    /// evaluator and by callers parked on the cached-telemetry address.
    SnapshotReady { snapshot: TelemetrySnapshot },

    /// A recovery sequence ordered this unit into stopping mode ahead of a
    /// shutdown. Shutdown races stop being faults from here on.
    StoppingEntered { reasons: Vec<String> },

    // ═══════════════════════════════════════════════════════════════════════
    // Trading Layer Notifications (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// The trading layer registered a new interchange deal.
    DealRegistered { deal: DealRecord },

    /// An interchange deal changed state.
    DealUpdated { deal: DealRecord },

    /// An interchange deal was disposed.
    DealRemoved { deal_id: DealId },

    /// The voltage-reference role should move from one unit to another.
    ///
    /// Raised by the trading layer or an operator when the current
    /// reference unit needs to leave that role. Only the coordinator
    /// acts on it.
    HandoverRequested { from: UnitId, to: UnitId },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order,
    /// ensuring causality is preserved.
    pub fn priority(&self) -> EventPriority {
        match self {
            // Internal events (processed first at same time)
            Event::LocalDeviceUpdated { .. }
            | Event::DeviceCommandCompleted { .. }
            | Event::SnapshotReady { .. }
            | Event::StoppingEntered { .. } => EventPriority::Internal,

            // Timer events
            Event::SweepTimer
            | Event::HeartbeatTimer
            | Event::CollectionTimer
            | Event::RoundTimeoutTimer
            | Event::SettleTimer
            | Event::StopPollTimer
            | Event::StopDeadlineTimer => EventPriority::Timer,

            // Network events
            Event::HeartbeatReceived { .. }
            | Event::TelemetryRequested { .. }
            | Event::TelemetryReplyReceived { .. }
            | Event::FaultReported { .. }
            | Event::ScramReceived { .. }
            | Event::GlobalModeReceived { .. }
            | Event::ShutdownAllReceived { .. }
            | Event::ResetAllReceived { .. }
            | Event::DeviceCommandRequested { .. }
            | Event::CachedTelemetryRequested { .. }
            | Event::FaultQueryRequested { .. }
            | Event::DemoteRequested { .. }
            | Event::ShutdownRequested { .. }
            | Event::ResetRequested { .. }
            | Event::ReplyReceived { .. } => EventPriority::Network,

            // Trading layer events (processed last at same time)
            Event::DealRegistered { .. }
            | Event::DealUpdated { .. }
            | Event::DealRemoved { .. }
            | Event::HandoverRequested { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a network event (from another unit).
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Check if this is a timer event.
    pub fn is_timer(&self) -> bool {
        self.priority() == EventPriority::Timer
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            // Timers
            Event::SweepTimer => "SweepTimer",
            Event::HeartbeatTimer => "HeartbeatTimer",
            Event::CollectionTimer => "CollectionTimer",
            Event::RoundTimeoutTimer => "RoundTimeoutTimer",
            Event::SettleTimer => "SettleTimer",
            Event::StopPollTimer => "StopPollTimer",
            Event::StopDeadlineTimer => "StopDeadlineTimer",

            // Network - Broadcasts
            Event::HeartbeatReceived { .. } => "HeartbeatReceived",
            Event::TelemetryRequested { .. } => "TelemetryRequested",
            Event::TelemetryReplyReceived { .. } => "TelemetryReplyReceived",
            Event::FaultReported { .. } => "FaultReported",
            Event::ScramReceived { .. } => "ScramReceived",
            Event::GlobalModeReceived { .. } => "GlobalModeReceived",
            Event::ShutdownAllReceived { .. } => "ShutdownAllReceived",
            Event::ResetAllReceived { .. } => "ResetAllReceived",

            // Network - Incoming Requests
            Event::DeviceCommandRequested { .. } => "DeviceCommandRequested",
            Event::CachedTelemetryRequested { .. } => "CachedTelemetryRequested",
            Event::FaultQueryRequested { .. } => "FaultQueryRequested",
            Event::DemoteRequested { .. } => "DemoteRequested",
            Event::ShutdownRequested { .. } => "ShutdownRequested",
            Event::ResetRequested { .. } => "ResetRequested",
            Event::ReplyReceived { .. } => "ReplyReceived",

            // Device Adapter Callbacks
            Event::LocalDeviceUpdated { .. } => "LocalDeviceUpdated",
            Event::DeviceCommandCompleted { .. } => "DeviceCommandCompleted",

            // Internal Events
            Event::SnapshotReady { .. } => "SnapshotReady",
            Event::StoppingEntered { .. } => "StoppingEntered",

            // Trading Layer Notifications
            Event::DealRegistered { .. } => "DealRegistered",
            Event::DealUpdated { .. } => "DealUpdated",
            Event::DealRemoved { .. } => "DealRemoved",
            Event::HandoverRequested { .. } => "HandoverRequested",
        }
    }
}

/// Map a fired timer to its event.
///
/// Both runners use this when a timer set via `Action::SetTimer` expires.
/// Timer events carry no payload: machines resolve staleness from their
/// own state, never from data baked into the timer.
pub fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Sweep => Event::SweepTimer,
        TimerId::Heartbeat => Event::HeartbeatTimer,
        TimerId::Collection => Event::CollectionTimer,
        TimerId::RoundTimeout => Event::RoundTimeoutTimer,
        TimerId::Settle => Event::SettleTimer,
        TimerId::StopPoll => Event::StopPollTimer,
        TimerId::StopDeadline => Event::StopDeadlineTimer,
    }
}
