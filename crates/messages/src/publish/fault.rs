//! Cluster-wide fault reporting.

use gridmesh_types::{FaultRecord, NetworkMessage};
use serde::{Deserialize, Serialize};

use crate::trace_context::TraceContext;

/// A fault record published to every unit in the cluster.
///
/// Local faults are acted on only by the unit they originate from; global
/// faults are acted on only by the coordinator. Every unit still receives
/// the full stream for logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultReportBroadcast {
    pub fault: FaultRecord,
    #[serde(default)]
    pub trace_context: TraceContext,
}

impl FaultReportBroadcast {
    pub fn new(fault: FaultRecord) -> Self {
        Self {
            fault,
            trace_context: TraceContext::from_current(),
        }
    }

    pub fn fault(&self) -> &FaultRecord {
        &self.fault
    }

    pub fn into_fault(self) -> FaultRecord {
        self.fault
    }
}

impl NetworkMessage for FaultReportBroadcast {
    fn message_type_id() -> &'static str {
        "fault.report"
    }
}
