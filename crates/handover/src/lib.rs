//! Voltage reference handover.
//!
//! Moves the voltage reference role from one unit to another without ever
//! leaving the grid segment unreferenced. The transfer runs as four device
//! commands, each verified against the mode the device reports back before
//! the next one is issued:
//!
//! 1. The outgoing reference is re-asserted with a droop slope so two
//!    references can briefly coexist.
//! 2. The incoming unit is switched to voltage reference with the same
//!    droop slope.
//! 3. The outgoing unit is released to its follow-up mode.
//! 4. The incoming reference is stiffened by zeroing its droop slope.
//!
//! While a transfer is in flight the coordinator's safety checks on
//! reference count are suppressed; the overlap in step 2 and 3 is
//! intentional. A reply that reports a different mode than requested, or a
//! failed request, aborts the transfer and raises a fault attributed to the
//! unit that failed to comply.

mod state;

pub use state::{HandoverPhase, HandoverState, HandoverStats};
