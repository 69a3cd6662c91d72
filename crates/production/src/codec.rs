//! Wire codec for the cluster bus.
//!
//! A frame is one JSON line: a version-tagged envelope carrying the
//! logical address, the sender, and the message body. Inbound frames
//! dispatch on the address to the typed wire message and convert to the
//! event the state machine handles; the mapping is the same one the
//! simulation runner applies in memory.

use gridmesh_core::{Event, OutboundMessage, OutboundRequest, RequestId};
use gridmesh_messages::{
    CachedTelemetryRequest, DealRegisteredBroadcast, DealRemovedBroadcast, DealUpdatedBroadcast,
    DemoteRequest, DeviceExecuteRequest, DisposeDealRequest, FaultQueryRequest,
    FaultReportBroadcast, GlobalModeBroadcast, HeartbeatBroadcast, RequestOutcome,
    ResetAllBroadcast, ResetRequest, ScramBroadcast, ShutdownAllBroadcast, ShutdownRequest,
    StopDealRequest, TelemetryReply, TelemetryRequestBroadcast, TraceContext,
};
use gridmesh_types::{NetworkMessage, UnitId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Wire format version. Bump on breaking envelope changes.
pub const WIRE_VERSION: u8 = 1;

/// Errors from encoding or decoding bus frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported wire version {0}")]
    UnknownVersion(u8),

    #[error("unknown address: {0}")]
    UnknownAddress(String),

    #[error("{0} frame without correlation id")]
    MissingCorrelation(&'static str),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum FrameKind {
    Publish,
    Request,
    Reply,
}

/// One JSON line on the bus.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    v: u8,
    kind: FrameKind,
    address: String,
    /// Sending unit, or `None` for the trading layer.
    sender: Option<UnitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation: Option<u64>,
    body: Value,
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    /// Broadcast or direct message, already mapped to its event.
    Message {
        sender: Option<UnitId>,
        address: String,
        event: Event,
        /// Trace context carried by heartbeats and fault reports.
        trace_context: Option<TraceContext>,
    },

    /// A request this process is asked to serve.
    ///
    /// The bus allocates the inbound [`RequestId`] and remembers
    /// `correlation` so the reply can be routed back to the sender.
    Request {
        sender: Option<UnitId>,
        correlation: u64,
        request: OutboundRequest,
    },

    /// The answer to a request this process sent, on the address of the
    /// original request.
    Reply {
        address: String,
        correlation: u64,
        outcome: RequestOutcome,
    },
}

/// Encode a broadcast or direct message as one wire line.
pub fn encode_message(sender: UnitId, message: &OutboundMessage) -> Result<String, CodecError> {
    let envelope = Envelope {
        v: WIRE_VERSION,
        kind: FrameKind::Publish,
        address: message.address().to_string(),
        sender: Some(sender),
        correlation: None,
        body: message_body(message)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Encode a request frame.
///
/// `correlation` must be unique among this process's in-flight requests;
/// the serving side echoes it on the reply frame.
pub fn encode_request(
    sender: UnitId,
    correlation: u64,
    request: &OutboundRequest,
) -> Result<String, CodecError> {
    let envelope = Envelope {
        v: WIRE_VERSION,
        kind: FrameKind::Request,
        address: request.address().to_string(),
        sender: Some(sender),
        correlation: Some(correlation),
        body: request_body(request)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Encode a reply frame answering `correlation` on `address`.
pub fn encode_reply(
    sender: UnitId,
    address: &str,
    correlation: u64,
    outcome: &RequestOutcome,
) -> Result<String, CodecError> {
    let envelope = Envelope {
        v: WIRE_VERSION,
        kind: FrameKind::Reply,
        address: address.to_string(),
        sender: Some(sender),
        correlation: Some(correlation),
        body: serde_json::to_value(outcome)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode one wire line.
pub fn decode_frame(line: &str) -> Result<Frame, CodecError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    if envelope.v != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(envelope.v));
    }

    match envelope.kind {
        FrameKind::Publish => {
            let (event, trace_context) = message_event(&envelope.address, envelope.body)?;
            Ok(Frame::Message {
                sender: envelope.sender,
                address: envelope.address,
                event,
                trace_context,
            })
        }
        FrameKind::Request => {
            let correlation = envelope
                .correlation
                .ok_or(CodecError::MissingCorrelation("request"))?;
            let request = decode_request(&envelope.address, envelope.body)?;
            Ok(Frame::Request {
                sender: envelope.sender,
                correlation,
                request,
            })
        }
        FrameKind::Reply => {
            let correlation = envelope
                .correlation
                .ok_or(CodecError::MissingCorrelation("reply"))?;
            let outcome: RequestOutcome = serde_json::from_value(envelope.body)?;
            Ok(Frame::Reply {
                address: envelope.address,
                correlation,
                outcome,
            })
        }
    }
}

/// The event a message produces at its subscribers.
///
/// Self-delivery short-circuits the wire: the bus converts its own
/// broadcasts directly instead of encoding and re-decoding them.
pub fn local_event(message: OutboundMessage) -> Event {
    match message {
        OutboundMessage::Heartbeat(heartbeat) => Event::HeartbeatReceived {
            coordinator: heartbeat.coordinator,
        },
        OutboundMessage::TelemetryRequest(request) => Event::TelemetryRequested {
            round: request.round,
            requester: request.requester,
        },
        OutboundMessage::TelemetryReply(reply) => Event::TelemetryReplyReceived {
            round: reply.round,
            telemetry: reply.telemetry,
        },
        OutboundMessage::FaultReport(report) => Event::FaultReported {
            fault: report.fault,
        },
        OutboundMessage::Scram(scram) => Event::ScramReceived {
            exclude_voltage_reference: scram.exclude_voltage_reference,
            reasons: scram.reasons,
        },
        OutboundMessage::GlobalMode(change) => Event::GlobalModeReceived {
            mode: change.mode,
            reasons: change.reasons,
        },
        OutboundMessage::ShutdownAll(order) => Event::ShutdownAllReceived {
            reasons: order.reasons,
        },
        OutboundMessage::ResetAll(order) => Event::ResetAllReceived {
            reasons: order.reasons,
        },
        OutboundMessage::DealRegistered(notice) => Event::DealRegistered { deal: notice.deal },
        OutboundMessage::DealUpdated(notice) => Event::DealUpdated { deal: notice.deal },
        OutboundMessage::DealRemoved(notice) => Event::DealRemoved {
            deal_id: notice.deal_id,
        },
    }
}

/// The event an incoming request produces at the serving unit, carrying
/// the inbound id its reply must echo.
///
/// Interchange requests return `None`: only the trading layer serves
/// those, and a unit that receives one answers not-found.
pub fn request_event(request: OutboundRequest, request_id: RequestId) -> Option<Event> {
    Some(match request {
        OutboundRequest::DeviceExecute(execute) => Event::DeviceCommandRequested {
            request_id,
            command: execute.command,
        },
        OutboundRequest::CachedTelemetry(cached) => Event::CachedTelemetryRequested {
            request_id,
            not_older_than: cached.bound(),
        },
        OutboundRequest::FaultQuery(_) => Event::FaultQueryRequested { request_id },
        OutboundRequest::Demote(demote) => Event::DemoteRequested {
            request_id,
            reasons: demote.reasons,
        },
        OutboundRequest::Shutdown(shutdown) => Event::ShutdownRequested {
            request_id,
            reasons: shutdown.reasons,
        },
        OutboundRequest::Reset(reset) => Event::ResetRequested {
            request_id,
            reasons: reset.reasons,
        },
        OutboundRequest::StopDeal(_) | OutboundRequest::DisposeDeal(_) => return None,
    })
}

fn message_body(message: &OutboundMessage) -> Result<Value, CodecError> {
    let body = match message {
        OutboundMessage::Heartbeat(m) => serde_json::to_value(m),
        OutboundMessage::TelemetryRequest(m) => serde_json::to_value(m),
        OutboundMessage::TelemetryReply(m) => serde_json::to_value(m),
        OutboundMessage::FaultReport(m) => serde_json::to_value(m),
        OutboundMessage::Scram(m) => serde_json::to_value(m),
        OutboundMessage::GlobalMode(m) => serde_json::to_value(m),
        OutboundMessage::ShutdownAll(m) => serde_json::to_value(m),
        OutboundMessage::ResetAll(m) => serde_json::to_value(m),
        OutboundMessage::DealRegistered(m) => serde_json::to_value(m),
        OutboundMessage::DealUpdated(m) => serde_json::to_value(m),
        OutboundMessage::DealRemoved(m) => serde_json::to_value(m),
    }?;
    Ok(body)
}

fn request_body(request: &OutboundRequest) -> Result<Value, CodecError> {
    let body = match request {
        OutboundRequest::DeviceExecute(r) => serde_json::to_value(r),
        OutboundRequest::StopDeal(r) => serde_json::to_value(r),
        OutboundRequest::DisposeDeal(r) => serde_json::to_value(r),
        OutboundRequest::CachedTelemetry(r) => serde_json::to_value(r),
        OutboundRequest::FaultQuery(r) => serde_json::to_value(r),
        OutboundRequest::Demote(r) => serde_json::to_value(r),
        OutboundRequest::Shutdown(r) => serde_json::to_value(r),
        OutboundRequest::Reset(r) => serde_json::to_value(r),
    }?;
    Ok(body)
}

fn message_event(address: &str, body: Value) -> Result<(Event, Option<TraceContext>), CodecError> {
    let decoded = match address {
        a if a == HeartbeatBroadcast::message_type_id() => {
            let msg: HeartbeatBroadcast = serde_json::from_value(body)?;
            let trace = carried_trace(msg.trace_context);
            (
                Event::HeartbeatReceived {
                    coordinator: msg.coordinator,
                },
                trace,
            )
        }
        a if a == TelemetryRequestBroadcast::message_type_id() => {
            let msg: TelemetryRequestBroadcast = serde_json::from_value(body)?;
            (
                Event::TelemetryRequested {
                    round: msg.round,
                    requester: msg.requester,
                },
                None,
            )
        }
        a if a == TelemetryReply::message_type_id() => {
            let msg: TelemetryReply = serde_json::from_value(body)?;
            (
                Event::TelemetryReplyReceived {
                    round: msg.round,
                    telemetry: msg.telemetry,
                },
                None,
            )
        }
        a if a == FaultReportBroadcast::message_type_id() => {
            let msg: FaultReportBroadcast = serde_json::from_value(body)?;
            let trace = carried_trace(msg.trace_context.clone());
            (Event::FaultReported { fault: msg.fault }, trace)
        }
        a if a == ScramBroadcast::message_type_id() => {
            let msg: ScramBroadcast = serde_json::from_value(body)?;
            (
                Event::ScramReceived {
                    exclude_voltage_reference: msg.exclude_voltage_reference,
                    reasons: msg.reasons,
                },
                None,
            )
        }
        a if a == GlobalModeBroadcast::message_type_id() => {
            let msg: GlobalModeBroadcast = serde_json::from_value(body)?;
            (
                Event::GlobalModeReceived {
                    mode: msg.mode,
                    reasons: msg.reasons,
                },
                None,
            )
        }
        a if a == ShutdownAllBroadcast::message_type_id() => {
            let msg: ShutdownAllBroadcast = serde_json::from_value(body)?;
            (
                Event::ShutdownAllReceived {
                    reasons: msg.reasons,
                },
                None,
            )
        }
        a if a == ResetAllBroadcast::message_type_id() => {
            let msg: ResetAllBroadcast = serde_json::from_value(body)?;
            (
                Event::ResetAllReceived {
                    reasons: msg.reasons,
                },
                None,
            )
        }
        a if a == DealRegisteredBroadcast::message_type_id() => {
            let msg: DealRegisteredBroadcast = serde_json::from_value(body)?;
            (Event::DealRegistered { deal: msg.deal }, None)
        }
        a if a == DealUpdatedBroadcast::message_type_id() => {
            let msg: DealUpdatedBroadcast = serde_json::from_value(body)?;
            (Event::DealUpdated { deal: msg.deal }, None)
        }
        a if a == DealRemovedBroadcast::message_type_id() => {
            let msg: DealRemovedBroadcast = serde_json::from_value(body)?;
            (
                Event::DealRemoved {
                    deal_id: msg.deal_id,
                },
                None,
            )
        }
        _ => return Err(CodecError::UnknownAddress(address.to_string())),
    };
    Ok(decoded)
}

fn decode_request(address: &str, body: Value) -> Result<OutboundRequest, CodecError> {
    let request = match address {
        a if a == DeviceExecuteRequest::message_type_id() => {
            serde_json::from_value::<DeviceExecuteRequest>(body)?.into()
        }
        a if a == StopDealRequest::message_type_id() => {
            serde_json::from_value::<StopDealRequest>(body)?.into()
        }
        a if a == DisposeDealRequest::message_type_id() => {
            serde_json::from_value::<DisposeDealRequest>(body)?.into()
        }
        a if a == CachedTelemetryRequest::message_type_id() => {
            serde_json::from_value::<CachedTelemetryRequest>(body)?.into()
        }
        a if a == FaultQueryRequest::message_type_id() => {
            serde_json::from_value::<FaultQueryRequest>(body)?.into()
        }
        a if a == DemoteRequest::message_type_id() => {
            serde_json::from_value::<DemoteRequest>(body)?.into()
        }
        a if a == ShutdownRequest::message_type_id() => {
            serde_json::from_value::<ShutdownRequest>(body)?.into()
        }
        a if a == ResetRequest::message_type_id() => {
            serde_json::from_value::<ResetRequest>(body)?.into()
        }
        _ => return Err(CodecError::UnknownAddress(address.to_string())),
    };
    Ok(request)
}

fn carried_trace(trace: TraceContext) -> Option<TraceContext> {
    if trace.has_trace() {
        Some(trace)
    } else {
        None
    }
}
