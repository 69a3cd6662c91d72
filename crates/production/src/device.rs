//! Hardware adapter boundary.
//!
//! The runner talks to the power-conversion hardware through
//! [`DeviceAdapter`] and nothing else: commands delegated by the state
//! machine and the periodic status sample both go through it, off the
//! event loop via `spawn_blocking`. Implementations wrap whatever the
//! real device speaks (Modbus, CAN, a vendor SDK); [`LoopbackDevice`]
//! stands in wherever no hardware is attached.

use gridmesh_types::{DeviceCommand, DeviceMode, DeviceStatus};
use parking_lot::Mutex;
use thiserror::Error;

/// Errors from the hardware adapter.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device refused the command.
    #[error("device rejected command: {0}")]
    Rejected(String),

    /// The device could not be reached at all.
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous interface to one power-conversion device.
///
/// Calls may block; the runner wraps every call in `spawn_blocking`.
/// The status a successful `execute` returns is the ground truth the
/// state machine verifies commands against, so implementations must
/// report the mode the hardware actually landed in, not the one that
/// was requested.
pub trait DeviceAdapter: Send + Sync + 'static {
    /// Execute one command and report the resulting status.
    fn execute(&self, command: &DeviceCommand) -> Result<DeviceStatus, DeviceError>;

    /// Read the current status without changing anything.
    fn status(&self) -> Result<DeviceStatus, DeviceError>;
}

/// In-process device that applies commands instantly.
///
/// Mode changes land exactly as requested, a `SetMode` carrying a
/// voltage setpoint pins the grid voltage to it, and anything landing
/// in `Wait` zeroes the current. Useful for integration tests and for
/// running a unit without hardware attached.
#[derive(Debug, Default)]
pub struct LoopbackDevice {
    status: Mutex<DeviceStatus>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the device status, e.g. to model measured current.
    pub fn set_status(&self, status: DeviceStatus) {
        *self.status.lock() = status;
    }
}

impl DeviceAdapter for LoopbackDevice {
    fn execute(&self, command: &DeviceCommand) -> Result<DeviceStatus, DeviceError> {
        let mut status = self.status.lock();
        match command {
            DeviceCommand::Stop => {
                status.mode = DeviceMode::Wait;
                status.grid_current = 0.0;
            }
            DeviceCommand::SetMode {
                mode,
                grid_voltage_setpoint,
                droop_ratio: _,
            } => {
                status.mode = *mode;
                if let Some(setpoint) = grid_voltage_setpoint {
                    status.grid_voltage = *setpoint;
                }
                if *mode == DeviceMode::Wait {
                    status.grid_current = 0.0;
                }
            }
            DeviceCommand::GetStatus => {}
        }
        Ok(*status)
    }

    fn status(&self) -> Result<DeviceStatus, DeviceError> {
        Ok(*self.status.lock())
    }
}
