//! Local fault status query.

use gridmesh_types::{NetworkMessage, Request};
use serde::{Deserialize, Serialize};

/// Asks a unit's escalation dispatcher whether it currently has an active
/// fault (queued, being handled, or sustained in cooldown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FaultQueryRequest {}

impl FaultQueryRequest {
    pub fn new() -> Self {
        Self {}
    }
}

impl NetworkMessage for FaultQueryRequest {
    fn message_type_id() -> &'static str {
        "fault.localQuery"
    }
}

impl Request for FaultQueryRequest {
    type Response = bool;
}
