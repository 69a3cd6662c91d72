//! Per-unit telemetry and the cluster-wide snapshot.

use crate::{DeviceStatus, OperationMode, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// The state one unit reports in a telemetry reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitTelemetry {
    pub unit_id: UnitId,
    /// Last reported device status (mode and meter readings).
    pub device: DeviceStatus,
    /// This unit's effective trading mode.
    pub operation_mode: OperationMode,
    /// Number of interchanges currently gripping this unit.
    pub interlock_count: u32,
}

/// The last successful cluster-wide collection, keyed by unit id.
///
/// Owned by the aggregation service and replaced wholesale on each successful
/// round; read-only to every consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub units: BTreeMap<UnitId, UnitTelemetry>,
    /// Process-relative time the collection round finalized.
    pub taken_at: Duration,
}

impl TelemetrySnapshot {
    pub fn get(&self, unit: UnitId) -> Option<&UnitTelemetry> {
        self.units.get(&unit)
    }

    pub fn unit_ids(&self) -> BTreeSet<UnitId> {
        self.units.keys().copied().collect()
    }

    /// Units whose device currently reports voltage-reference mode.
    ///
    /// The voltage-reference role is derived, never stored: this scan is the
    /// single source of truth for who holds it.
    pub fn voltage_references(&self) -> Vec<UnitId> {
        self.units
            .values()
            .filter(|t| t.device.mode.is_voltage_reference())
            .map(|t| t.unit_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
