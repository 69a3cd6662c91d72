//! Request/reply message bodies.
//!
//! Each request type names its logical address via
//! [`NetworkMessage::message_type_id`](gridmesh_types::NetworkMessage) and
//! its expected reply via [`Request::Response`](gridmesh_types::Request).

mod device;
mod fault;
mod interchange;
mod telemetry;
mod unit;

pub use device::DeviceExecuteRequest;
pub use fault::FaultQueryRequest;
pub use interchange::{DisposeDealRequest, StopDealRequest};
pub use telemetry::CachedTelemetryRequest;
pub use unit::{DemoteRequest, ResetRequest, ShutdownRequest};
