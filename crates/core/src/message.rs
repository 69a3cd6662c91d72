//! Outbound message types for network communication.

use gridmesh_messages::{
    CachedTelemetryRequest, DealRegisteredBroadcast, DealRemovedBroadcast, DealUpdatedBroadcast,
    DemoteRequest, DeviceExecuteRequest, DisposeDealRequest, FaultQueryRequest,
    FaultReportBroadcast, GlobalModeBroadcast, HeartbeatBroadcast, ResetAllBroadcast, ResetRequest,
    ScramBroadcast, ShutdownAllBroadcast, ShutdownRequest, StopDealRequest, TelemetryReply,
    TelemetryRequestBroadcast, TraceContext,
};
use gridmesh_types::NetworkMessage;

/// Outbound broadcast and point-to-point messages.
///
/// These are the messages a unit can publish or send. The runner handles
/// the actual network I/O, routing each message to its logical address.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Coordinator uniqueness heartbeat (claim or query).
    Heartbeat(HeartbeatBroadcast),

    /// Opens a telemetry aggregation round.
    TelemetryRequest(TelemetryRequestBroadcast),

    /// One unit's telemetry answer, sent to the round's requester.
    TelemetryReply(TelemetryReply),

    /// Cluster-wide fault report.
    FaultReport(FaultReportBroadcast),

    /// Emergency stop order.
    Scram(ScramBroadcast),

    /// Cluster-wide trading mode change.
    GlobalMode(GlobalModeBroadcast),

    /// Shut down every unit process.
    ShutdownAll(ShutdownAllBroadcast),

    /// Restart every unit process with fresh state.
    ResetAll(ResetAllBroadcast),

    /// Deal lifecycle notifications, published by the trading layer.
    DealRegistered(DealRegisteredBroadcast),
    DealUpdated(DealUpdatedBroadcast),
    DealRemoved(DealRemovedBroadcast),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Heartbeat(_) => "Heartbeat",
            OutboundMessage::TelemetryRequest(_) => "TelemetryRequest",
            OutboundMessage::TelemetryReply(_) => "TelemetryReply",
            OutboundMessage::FaultReport(_) => "FaultReport",
            OutboundMessage::Scram(_) => "Scram",
            OutboundMessage::GlobalMode(_) => "GlobalMode",
            OutboundMessage::ShutdownAll(_) => "ShutdownAll",
            OutboundMessage::ResetAll(_) => "ResetAll",
            OutboundMessage::DealRegistered(_) => "DealRegistered",
            OutboundMessage::DealUpdated(_) => "DealUpdated",
            OutboundMessage::DealRemoved(_) => "DealRemoved",
        }
    }

    /// The logical address this message is published on.
    pub fn address(&self) -> &'static str {
        match self {
            OutboundMessage::Heartbeat(_) => HeartbeatBroadcast::message_type_id(),
            OutboundMessage::TelemetryRequest(_) => TelemetryRequestBroadcast::message_type_id(),
            OutboundMessage::TelemetryReply(_) => TelemetryReply::message_type_id(),
            OutboundMessage::FaultReport(_) => FaultReportBroadcast::message_type_id(),
            OutboundMessage::Scram(_) => ScramBroadcast::message_type_id(),
            OutboundMessage::GlobalMode(_) => GlobalModeBroadcast::message_type_id(),
            OutboundMessage::ShutdownAll(_) => ShutdownAllBroadcast::message_type_id(),
            OutboundMessage::ResetAll(_) => ResetAllBroadcast::message_type_id(),
            OutboundMessage::DealRegistered(_) => DealRegisteredBroadcast::message_type_id(),
            OutboundMessage::DealUpdated(_) => DealUpdatedBroadcast::message_type_id(),
            OutboundMessage::DealRemoved(_) => DealRemovedBroadcast::message_type_id(),
        }
    }

    /// Inject trace context into messages that carry it.
    ///
    /// Heartbeats and fault reports link the spans that caused them; the
    /// other messages are not traced across units.
    ///
    /// When the `trace-propagation` feature is disabled in the messages
    /// crate, this sets an empty trace context (no-op).
    pub fn inject_trace_context(&mut self) {
        let ctx = TraceContext::from_current();
        match self {
            OutboundMessage::Heartbeat(heartbeat) => {
                heartbeat.trace_context = ctx;
            }
            OutboundMessage::FaultReport(report) => {
                report.trace_context = ctx;
            }
            OutboundMessage::TelemetryRequest(_)
            | OutboundMessage::TelemetryReply(_)
            | OutboundMessage::Scram(_)
            | OutboundMessage::GlobalMode(_)
            | OutboundMessage::ShutdownAll(_)
            | OutboundMessage::ResetAll(_)
            | OutboundMessage::DealRegistered(_)
            | OutboundMessage::DealUpdated(_)
            | OutboundMessage::DealRemoved(_) => {}
        }
    }
}

macro_rules! impl_from_message {
    ($($inner:ident => $variant:ident),* $(,)?) => {
        $(impl From<$inner> for OutboundMessage {
            fn from(message: $inner) -> Self {
                OutboundMessage::$variant(message)
            }
        })*
    };
}

impl_from_message! {
    HeartbeatBroadcast => Heartbeat,
    TelemetryRequestBroadcast => TelemetryRequest,
    TelemetryReply => TelemetryReply,
    FaultReportBroadcast => FaultReport,
    ScramBroadcast => Scram,
    GlobalModeBroadcast => GlobalMode,
    ShutdownAllBroadcast => ShutdownAll,
    ResetAllBroadcast => ResetAll,
    DealRegisteredBroadcast => DealRegistered,
    DealUpdatedBroadcast => DealUpdated,
    DealRemovedBroadcast => DealRemoved,
}

/// Outbound requests expecting exactly one reply.
#[derive(Debug, Clone)]
pub enum OutboundRequest {
    /// Execute a command on a unit's device.
    DeviceExecute(DeviceExecuteRequest),

    /// Ask the trading layer to deactivate a deal.
    StopDeal(StopDealRequest),

    /// Ask the trading layer to dispose of a deal.
    DisposeDeal(DisposeDealRequest),

    /// Ask the aggregation service for a snapshot.
    CachedTelemetry(CachedTelemetryRequest),

    /// Ask a unit whether it has an active fault.
    FaultQuery(FaultQueryRequest),

    /// Ask the coordinator to give up the role.
    Demote(DemoteRequest),

    /// Order one unit to shut down.
    Shutdown(ShutdownRequest),

    /// Order one unit to restart with fresh state.
    Reset(ResetRequest),
}

impl OutboundRequest {
    /// Get a human-readable name for this request type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundRequest::DeviceExecute(_) => "DeviceExecute",
            OutboundRequest::StopDeal(_) => "StopDeal",
            OutboundRequest::DisposeDeal(_) => "DisposeDeal",
            OutboundRequest::CachedTelemetry(_) => "CachedTelemetry",
            OutboundRequest::FaultQuery(_) => "FaultQuery",
            OutboundRequest::Demote(_) => "Demote",
            OutboundRequest::Shutdown(_) => "Shutdown",
            OutboundRequest::Reset(_) => "Reset",
        }
    }

    /// The logical address this request is served on.
    pub fn address(&self) -> &'static str {
        match self {
            OutboundRequest::DeviceExecute(_) => DeviceExecuteRequest::message_type_id(),
            OutboundRequest::StopDeal(_) => StopDealRequest::message_type_id(),
            OutboundRequest::DisposeDeal(_) => DisposeDealRequest::message_type_id(),
            OutboundRequest::CachedTelemetry(_) => CachedTelemetryRequest::message_type_id(),
            OutboundRequest::FaultQuery(_) => FaultQueryRequest::message_type_id(),
            OutboundRequest::Demote(_) => DemoteRequest::message_type_id(),
            OutboundRequest::Shutdown(_) => ShutdownRequest::message_type_id(),
            OutboundRequest::Reset(_) => ResetRequest::message_type_id(),
        }
    }
}

macro_rules! impl_from_request {
    ($($inner:ident => $variant:ident),* $(,)?) => {
        $(impl From<$inner> for OutboundRequest {
            fn from(request: $inner) -> Self {
                OutboundRequest::$variant(request)
            }
        })*
    };
}

impl_from_request! {
    DeviceExecuteRequest => DeviceExecute,
    StopDealRequest => StopDeal,
    DisposeDealRequest => DisposeDeal,
    CachedTelemetryRequest => CachedTelemetry,
    FaultQueryRequest => FaultQuery,
    DemoteRequest => Demote,
    ShutdownRequest => Shutdown,
    ResetRequest => Reset,
}
