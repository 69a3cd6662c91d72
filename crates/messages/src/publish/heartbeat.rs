//! Coordinator uniqueness heartbeat.

use gridmesh_types::{NetworkMessage, UnitId};
use serde::{Deserialize, Serialize};

use crate::trace_context::TraceContext;

/// Periodic claim of the coordinator role, or a query for it.
///
/// A coordinator publishes its own identity on a fixed interval. A unit
/// that needs to learn the current coordinator publishes the query form
/// (`coordinator: None`) on the same address; every listening coordinator
/// answers by publishing its identity immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBroadcast {
    /// Claimed coordinator identity, or `None` for a query.
    pub coordinator: Option<UnitId>,
    /// Trace context for linking spans across units.
    #[serde(default)]
    pub trace_context: TraceContext,
}

impl HeartbeatBroadcast {
    /// A coordinator claiming the role.
    pub fn claim(coordinator: UnitId) -> Self {
        Self {
            coordinator: Some(coordinator),
            trace_context: TraceContext::from_current(),
        }
    }

    /// A query asking the current coordinator to identify itself.
    pub fn query() -> Self {
        Self {
            coordinator: None,
            trace_context: TraceContext::from_current(),
        }
    }

    /// Whether this is the query form rather than a claim.
    pub fn is_query(&self) -> bool {
        self.coordinator.is_none()
    }
}

impl NetworkMessage for HeartbeatBroadcast {
    fn message_type_id() -> &'static str {
        "coordinator.uniqueness.heartbeat"
    }
}
