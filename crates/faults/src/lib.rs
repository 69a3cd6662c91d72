//! Fault collection and the active-fault window.
//!
//! Every component reports precondition violations as immutable fault
//! records. The collector decides which of those observations this unit
//! retains:
//!
//! - WARN is advisory. It is logged and dropped, and never escalates.
//! - LOCAL faults are retained only by the unit that raised them.
//! - GLOBAL faults are retained by the coordinator, which alone runs the
//!   cluster-wide recovery sequences. Other units log the observation and
//!   move on; if the condition persists it will be raised again.
//!
//! Retained faults sit in per-cell queues (category crossed with severity)
//! until the escalation dispatcher drains them, one cell at a time. A unit
//! reports an active fault while anything is queued or being handled, and
//! for a sustain period after handling completes, so that a just-recovered
//! unit is not immediately offered new interchanges.

mod collector;

pub use collector::{FaultCollector, FaultCollectorStats};
