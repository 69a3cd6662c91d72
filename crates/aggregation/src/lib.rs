//! Telemetry aggregation service.
//!
//! The coordinator opens a collection round on a fixed cadence: it
//! broadcasts a round-numbered request, every unit answers with its
//! telemetry record, and the round closes either when every member has
//! answered or when the reply window expires. The completed snapshot is
//! cached and handed to the safety evaluator.
//!
//! # Rounds instead of reply channels
//!
//! Replies carry the round number they answer. A reply whose round does
//! not match the open round is late by definition and is discarded, so
//! slow answers from a previous round can never leak into the current
//! snapshot. The round number is the only correlation state; there are no
//! per-round reply addresses to tear down.
//!
//! # Serving cached snapshots
//!
//! Callers ask for the snapshot with an optional freshness bound. A bound
//! satisfied by the cache is answered immediately; otherwise the caller is
//! parked and answered when the next round closes. A round that closes
//! with no replies keeps the previous cache, so parked callers are never
//! answered with an empty snapshot that merely reflects a dead bus.

mod state;

pub use state::{AggregationState, AggregationStats};
