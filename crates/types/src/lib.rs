//! Core types for the Gridmesh cluster control plane.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Identifiers**: UnitId, DealId
//! - **Fault model**: category, scope, severity, and the fault record
//! - **Cluster state**: Policy, telemetry snapshots, operation modes
//! - **Device model**: modes, commands, and reported status
//! - **Interchange records**: deal sides, activity flags, and the ledger
//! - **Network traits**: message markers for address-based routing
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod deal;
mod device;
mod fault;
mod identifiers;
mod mode;
mod network;
mod policy;
mod telemetry;

pub use deal::{DealLedger, DealRecord, DealSide, SideActivity};
pub use device::{DeviceCommand, DeviceMode, DeviceStatus};
pub use fault::{FaultCategory, FaultRecord, FaultScope, FaultSeverity};
pub use identifiers::{DealId, UnitId};
pub use mode::OperationMode;
pub use network::{NetworkMessage, Request};
pub use policy::Policy;
pub use telemetry::{TelemetrySnapshot, UnitTelemetry};

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use std::time::Duration;

    /// Create a policy whose membership is the given unit ids, with default
    /// timings and a 30 A per-unit current allowance.
    pub fn test_policy(members: &[u64]) -> Policy {
        let mut policy = Policy::default();
        policy.members = members.iter().copied().map(UnitId).collect();
        policy.per_unit_allowance = 30.0;
        policy
    }

    /// Create a telemetry record for one unit.
    pub fn test_telemetry(unit: u64, mode: DeviceMode, grid_current: f64) -> UnitTelemetry {
        UnitTelemetry {
            unit_id: UnitId(unit),
            device: DeviceStatus {
                mode,
                grid_voltage: 380.0,
                grid_current,
            },
            operation_mode: OperationMode::Run,
            interlock_count: 0,
        }
    }

    /// Create a snapshot from (unit, mode, current) triples, taken at `taken_at`.
    pub fn test_snapshot(
        entries: &[(u64, DeviceMode, f64)],
        taken_at: Duration,
    ) -> TelemetrySnapshot {
        let units = entries
            .iter()
            .map(|&(id, mode, current)| (UnitId(id), test_telemetry(id, mode, current)))
            .collect();
        TelemetrySnapshot { units, taken_at }
    }

    /// Create a deal between a discharge unit and a charge unit, both active.
    pub fn test_deal(id: u64, discharge: u64, charge: u64) -> DealRecord {
        DealRecord {
            deal_id: DealId(id),
            discharge_unit: UnitId(discharge),
            charge_unit: UnitId(charge),
            discharge_activity: SideActivity::Active,
            charge_activity: SideActivity::Active,
            discharge_grid_voltage: Some(380.0),
            charge_grid_voltage: Some(380.0),
            scrammed: false,
        }
    }

    /// Create a fault record with a fixed origin location and zero timestamp.
    pub fn test_fault(
        category: FaultCategory,
        scope: FaultScope,
        severity: FaultSeverity,
        origin: u64,
    ) -> FaultRecord {
        FaultRecord::new(
            category,
            scope,
            severity,
            UnitId(origin),
            format!("{category}/{scope}/{severity} test fault"),
            "test".to_string(),
            0,
        )
    }
}
