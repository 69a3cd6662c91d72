//! Telemetry aggregation round messages.

use gridmesh_types::{NetworkMessage, UnitId, UnitTelemetry};
use serde::{Deserialize, Serialize};

/// Coordinator's broadcast asking every unit for its current telemetry.
///
/// The `round` number stands in for a per-request reply channel: units echo
/// it back in their [`TelemetryReply`] so the coordinator can discard
/// replies that arrive after the round has already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRequestBroadcast {
    /// Aggregation round this request opens.
    pub round: u64,
    /// Unit that initiated the round and expects the replies.
    pub requester: UnitId,
}

impl TelemetryRequestBroadcast {
    pub fn new(round: u64, requester: UnitId) -> Self {
        Self { round, requester }
    }
}

impl NetworkMessage for TelemetryRequestBroadcast {
    fn message_type_id() -> &'static str {
        "coordinator.telemetry.broadcastRequest"
    }
}

/// One unit's answer to a [`TelemetryRequestBroadcast`], sent point-to-point
/// to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReply {
    /// Round the reply belongs to.
    pub round: u64,
    /// The replying unit's telemetry record.
    pub telemetry: UnitTelemetry,
}

impl TelemetryReply {
    pub fn new(round: u64, telemetry: UnitTelemetry) -> Self {
        Self { round, telemetry }
    }
}

impl NetworkMessage for TelemetryReply {
    fn message_type_id() -> &'static str {
        "coordinator.telemetry.reply"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmesh_types::test_utils::test_telemetry;
    use gridmesh_types::DeviceMode;

    #[test]
    fn test_message_type_ids() {
        assert_eq!(
            TelemetryRequestBroadcast::message_type_id(),
            "coordinator.telemetry.broadcastRequest"
        );
        assert_eq!(
            TelemetryReply::message_type_id(),
            "coordinator.telemetry.reply"
        );
    }

    #[test]
    fn test_reply_echoes_round() {
        let reply = TelemetryReply::new(42, test_telemetry(3, DeviceMode::Charge, -10.0));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["round"], 42);
        assert_eq!(json["telemetry"]["unitId"], 3);
    }
}
