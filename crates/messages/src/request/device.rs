//! Direct device command execution.

use gridmesh_types::{DeviceCommand, DeviceStatus, NetworkMessage, Request};
use serde::{Deserialize, Serialize};

/// Executes one command on a unit's power-conversion device.
///
/// The reply carries the device's status after the command was applied, so
/// the caller can verify the device actually reached the requested mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceExecuteRequest {
    pub command: DeviceCommand,
}

impl DeviceExecuteRequest {
    pub fn new(command: DeviceCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &DeviceCommand {
        &self.command
    }
}

impl NetworkMessage for DeviceExecuteRequest {
    fn message_type_id() -> &'static str {
        "device.control.execute"
    }
}

impl Request for DeviceExecuteRequest {
    type Response = DeviceStatus;
}
