//! Global safety evaluation.
//!
//! Every completed telemetry snapshot is checked by the coordinator for
//! cluster-level anomalies no single unit can see:
//!
//! - **Membership**: every configured member must appear in the snapshot.
//! - **Current budget**: over every interchange with both sides active,
//!   the absolute sum of the involved units' grid currents (each unit
//!   counted once) must stay within the per-unit allowance times the
//!   number of distinct units involved.
//! - **Voltage reference**: exactly one unit must be in voltage-reference
//!   mode.
//!
//! The budget check tolerates one transient breach: the first consecutive
//! breach is a warning, the second escalates to an error, and any normal
//! reading clears the streak.
//!
//! During a voltage-reference handover the device checks are suppressed,
//! since two references and unbalanced currents are expected mid-flight.
//! The membership check is never suppressed.

mod state;

pub use state::{SafetyState, SafetyStats};
