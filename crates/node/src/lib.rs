//! Unit composition root.
//!
//! [`UnitStateMachine`] composes the uniqueness guard, telemetry
//! aggregation, safety evaluator, handover driver, and escalation
//! dispatcher into one deterministic machine behind
//! [`gridmesh_core::StateMachine`]. Events that touch a single component
//! route through its `try_handle`; events that need the unit-wide mirrors
//! (device status, operation mode, the interchange ledger) are handled
//! here.

mod state;

pub use state::UnitStateMachine;
