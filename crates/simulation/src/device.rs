//! Simulated power-conversion device.

use gridmesh_types::{DeviceCommand, DeviceMode, DeviceStatus};

/// One unit's device adapter, executed inline by the runner.
///
/// Commands apply instantly. The device survives a unit process restart:
/// the hardware does not reboot when the control software does, so a
/// restarted unit finds its converter in whatever mode it was left in.
///
/// Failure injection:
/// - [`fail_with`](Self::fail_with) makes every command return an error,
///   as an unreachable or faulted adapter would.
/// - [`pin_mode`](Self::pin_mode) makes `SetMode` land in a fixed mode
///   regardless of the requested one, while still reporting success. This
///   is how tests exercise the verify-after-command paths: the caller
///   sees an `Ok` status whose mode is not the one it asked for.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    status: DeviceStatus,
    failure: Option<String>,
    pinned_mode: Option<DeviceMode>,
    commands_executed: u64,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current device status.
    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Overwrite the device status, e.g. to model measured current.
    pub fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
    }

    /// Make every subsequent command fail with `message`.
    pub fn fail_with(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    /// Let commands succeed again.
    pub fn clear_failure(&mut self) {
        self.failure = None;
    }

    /// Pin the mode `SetMode` lands in, or `None` to obey commands again.
    pub fn pin_mode(&mut self, mode: Option<DeviceMode>) {
        self.pinned_mode = mode;
    }

    /// Commands executed so far, including failed ones.
    pub fn commands_executed(&self) -> u64 {
        self.commands_executed
    }

    /// Execute one command and report the resulting status.
    pub fn execute(&mut self, command: &DeviceCommand) -> Result<DeviceStatus, String> {
        self.commands_executed += 1;
        if let Some(message) = &self.failure {
            return Err(message.clone());
        }

        match command {
            DeviceCommand::Stop => {
                self.status.mode = DeviceMode::Wait;
                self.status.grid_current = 0.0;
            }
            DeviceCommand::SetMode {
                mode,
                grid_voltage_setpoint,
                droop_ratio: _,
            } => {
                let landed = self.pinned_mode.unwrap_or(*mode);
                self.status.mode = landed;
                if let Some(setpoint) = grid_voltage_setpoint {
                    self.status.grid_voltage = *setpoint;
                }
                if landed == DeviceMode::Wait {
                    self.status.grid_current = 0.0;
                }
            }
            DeviceCommand::GetStatus => {}
        }
        Ok(self.status)
    }
}
