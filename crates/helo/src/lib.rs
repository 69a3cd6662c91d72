//! Coordinator uniqueness guard.
//!
//! Exactly one unit may act as coordinator. The guard makes violations
//! observable: the coordinator periodically publishes its identity on a
//! shared heartbeat address, and because every coordinator listens on the
//! same address, a second claimant is heard by the first.
//!
//! A heartbeat with an empty body is a query: any unit can publish it to
//! make the current coordinator identify itself immediately.
//!
//! The guard only detects; it never resolves. A conflicting claim raises a
//! global logic fault and the escalation dispatcher decides what dies.

mod state;

pub use state::{HeloState, HeloStats};
