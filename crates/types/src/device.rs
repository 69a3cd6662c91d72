//! Device control model.
//!
//! The power-conversion hardware itself sits behind an external adapter
//! reachable over `device.control.execute`; the core only speaks in terms of
//! the mode/command/status types defined here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating mode of a unit's power-conversion device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceMode {
    /// Converter idle, not moving power.
    Wait,
    /// Passive current-control charge.
    Charge,
    /// Passive current-control discharge.
    Discharge,
    /// This unit sets the shared DC grid voltage; all others follow.
    VoltageReference,
}

impl DeviceMode {
    pub fn is_voltage_reference(&self) -> bool {
        matches!(self, DeviceMode::VoltageReference)
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceMode::Wait => "wait",
            DeviceMode::Charge => "charge",
            DeviceMode::Discharge => "discharge",
            DeviceMode::VoltageReference => "voltageReference",
        };
        f.write_str(s)
    }
}

/// A command for a unit's device adapter.
///
/// Serializes as `{"command": ..., "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "camelCase")]
pub enum DeviceCommand {
    /// Switch the converter into `mode`, optionally re-issuing the voltage
    /// setpoint and droop ratio. A droop ratio is only meaningful together
    /// with voltage-reference mode.
    #[serde(rename_all = "camelCase")]
    SetMode {
        mode: DeviceMode,
        grid_voltage_setpoint: Option<f64>,
        droop_ratio: Option<f64>,
    },
    /// Stop the converter (mode becomes `Wait`).
    Stop,
    /// Read back the current status without changing anything.
    GetStatus,
}

impl DeviceCommand {
    /// The mode this command requests, if it requests one.
    pub fn requested_mode(&self) -> Option<DeviceMode> {
        match self {
            DeviceCommand::SetMode { mode, .. } => Some(*mode),
            DeviceCommand::Stop => Some(DeviceMode::Wait),
            DeviceCommand::GetStatus => None,
        }
    }
}

/// Status reported by a device adapter after executing a command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub mode: DeviceMode,
    /// Measured DC grid voltage in volts.
    pub grid_voltage: f64,
    /// Measured grid current in amperes, signed (positive = discharging).
    pub grid_current: f64,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            mode: DeviceMode::Wait,
            grid_voltage: 0.0,
            grid_current: 0.0,
        }
    }
}
