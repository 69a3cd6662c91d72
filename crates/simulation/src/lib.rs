//! Deterministic cluster simulation.
//!
//! Runs any number of [`gridmesh_node::UnitStateMachine`]s against a
//! simulated network, simulated device adapters, and a simulated deal
//! service, all driven from one global event queue. Given the same seed
//! and the same scenario, a run produces identical results every time,
//! which makes cluster-level behavior (scrams, handovers, escalation
//! sequences) assertable in ordinary tests.
//!
//! Time is virtual: the runner jumps from event to event, so a minute of
//! cluster time costs microseconds of wall time.

mod deal_service;
mod device;
mod event_queue;
mod network;
mod runner;

/// Index of one endpoint in the simulation.
///
/// Units are numbered `0..n` in ascending unit-id order; the deal service
/// sits at index `n`. Indexes are a routing detail of the simulation and
/// never appear in events or messages.
pub type NodeIndex = u32;

pub use deal_service::{DealServiceConfig, SimulatedDealService};
pub use device::SimulatedDevice;
pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats};
