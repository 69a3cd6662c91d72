//! Cluster messages for the control plane.
//!
//! Split by delivery style: [`publish`] types go to broadcast addresses
//! every unit subscribes to, [`request`] types expect exactly one reply
//! described in [`response`].

pub mod publish;
pub mod request;
pub mod response;
pub mod trace_context;

// Re-export commonly used types
pub use publish::{
    DealRegisteredBroadcast, DealRemovedBroadcast, DealUpdatedBroadcast, FaultReportBroadcast,
    GlobalModeBroadcast, HeartbeatBroadcast, ResetAllBroadcast, ScramBroadcast,
    ShutdownAllBroadcast, TelemetryReply, TelemetryRequestBroadcast,
};
pub use request::{
    CachedTelemetryRequest, DemoteRequest, DeviceExecuteRequest, DisposeDealRequest,
    FaultQueryRequest, ResetRequest, ShutdownRequest, StopDealRequest,
};
pub use response::{ReplyPayload, RequestError, RequestErrorKind, RequestOutcome};
pub use trace_context::TraceContext;
