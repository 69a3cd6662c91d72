//! Trading operation modes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a unit (or the cluster as a whole) participates in trading.
///
/// The global mode is broadcast by the coordinator; each unit also keeps a
/// local mode that recovery sequences may force to `Stopping` ahead of a
/// shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationMode {
    /// Normal operation: new interchanges may be created.
    Run,
    /// Winding down: existing interchanges drain, no new ones start.
    Stopping,
    /// Trading halted.
    Stop,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationMode::Run => "run",
            OperationMode::Stopping => "stopping",
            OperationMode::Stop => "stop",
        };
        f.write_str(s)
    }
}
