//! Fault escalation and recovery.
//!
//! The dispatcher sweeps the fault collector on a fixed period. Each sweep
//! walks the full category and severity cross product, drains every queued
//! fault cell by cell, and runs the matching recovery sequence to completion
//! before touching the next cell. Sequences are built from a small set of
//! primitives (stop my interchanges, stop my device, scram the cluster,
//! demote the coordinator, reset or shut down one unit or all of them) and
//! run strictly one at a time: several of them move cluster-wide state, so
//! two sequences in flight at once would race.
//!
//! A failed primitive is logged and the sequence moves on. Two exceptions
//! carry extra weight: an infrastructure failure during recovery is itself
//! reported as a fresh framework fault, and a coordinator demotion that
//! cannot be delivered forces this unit to shut down.
//!
//! The dispatcher also owns the unit's interchange ledger, mirrored from
//! the deal notifications on the bus. Recovery is the heaviest reader: the
//! ask-and-wait primitive polls it, and a scram walks it deal by deal.

mod matrix;
mod state;

pub use matrix::{sequence_for, Primitive};
pub use state::{RecoveryState, RecoveryStats};
