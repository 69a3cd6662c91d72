//! Publish/subscribe message bodies.
//!
//! Each type maps to one logical broadcast address via
//! [`NetworkMessage::message_type_id`](gridmesh_types::NetworkMessage).

mod control;
mod deal;
mod fault;
mod heartbeat;
mod telemetry;

pub use control::{GlobalModeBroadcast, ResetAllBroadcast, ScramBroadcast, ShutdownAllBroadcast};
pub use deal::{DealRegisteredBroadcast, DealRemovedBroadcast, DealUpdatedBroadcast};
pub use fault::FaultReportBroadcast;
pub use heartbeat::HeartbeatBroadcast;
pub use telemetry::{TelemetryReply, TelemetryRequestBroadcast};
