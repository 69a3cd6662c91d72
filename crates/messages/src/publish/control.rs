//! Cluster-wide control broadcasts.

use gridmesh_types::{NetworkMessage, OperationMode};
use serde::{Deserialize, Serialize};

/// Emergency stop order for every device in the cluster.
///
/// The first stage of a scram excludes the voltage reference so the grid
/// keeps a voltage source while the other devices drop out; the second
/// stage, after a settle delay, stops the reference as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScramBroadcast {
    /// Leave the voltage-reference device running for now.
    pub exclude_voltage_reference: bool,
    /// Fault messages that triggered the scram.
    pub reasons: Vec<String>,
}

impl ScramBroadcast {
    pub fn new(exclude_voltage_reference: bool, reasons: Vec<String>) -> Self {
        Self {
            exclude_voltage_reference,
            reasons,
        }
    }
}

impl NetworkMessage for ScramBroadcast {
    fn message_type_id() -> &'static str {
        "device.control.scram"
    }
}

/// Sets the cluster-wide trading mode on every unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalModeBroadcast {
    pub mode: OperationMode,
    pub reasons: Vec<String>,
}

impl GlobalModeBroadcast {
    pub fn new(mode: OperationMode, reasons: Vec<String>) -> Self {
        Self { mode, reasons }
    }
}

impl NetworkMessage for GlobalModeBroadcast {
    fn message_type_id() -> &'static str {
        "trading.globalMode.set"
    }
}

/// Orders every unit process to shut down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownAllBroadcast {
    pub reasons: Vec<String>,
}

impl ShutdownAllBroadcast {
    pub fn new(reasons: Vec<String>) -> Self {
        Self { reasons }
    }
}

impl NetworkMessage for ShutdownAllBroadcast {
    fn message_type_id() -> &'static str {
        "unit.shutdown.all"
    }
}

/// Orders every unit process to restart with fresh state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetAllBroadcast {
    pub reasons: Vec<String>,
}

impl ResetAllBroadcast {
    pub fn new(reasons: Vec<String>) -> Self {
        Self { reasons }
    }
}

impl NetworkMessage for ResetAllBroadcast {
    fn message_type_id() -> &'static str {
        "unit.reset.all"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_ids() {
        assert_eq!(ScramBroadcast::message_type_id(), "device.control.scram");
        assert_eq!(
            GlobalModeBroadcast::message_type_id(),
            "trading.globalMode.set"
        );
        assert_eq!(ShutdownAllBroadcast::message_type_id(), "unit.shutdown.all");
        assert_eq!(ResetAllBroadcast::message_type_id(), "unit.reset.all");
    }

    #[test]
    fn test_scram_wire_shape() {
        let scram = ScramBroadcast::new(true, vec!["overcurrent".into()]);
        let json = serde_json::to_value(&scram).unwrap();
        assert_eq!(json["excludeVoltageReference"], true);
        assert_eq!(json["reasons"][0], "overcurrent");
    }
}
