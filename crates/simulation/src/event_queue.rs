//! Deterministic ordering key for the global event queue.

use crate::NodeIndex;
use gridmesh_core::{Event, EventPriority};
use std::time::Duration;

/// Ordering key for one queued event.
///
/// The derived `Ord` sorts by time, then priority, then node index, then
/// insertion sequence, in declaration order. Two runs that schedule the
/// same events in the same order therefore pop them in the same order,
/// which is the root of the simulation's determinism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    /// Simulation time the event becomes due.
    pub time: Duration,
    /// Priority class of the event, captured at scheduling time.
    pub priority: EventPriority,
    /// Endpoint the event is addressed to.
    pub node_index: NodeIndex,
    /// Tie-breaker: global insertion counter.
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node_index,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_dominates_priority() {
        let early = EventKey::new(Duration::from_secs(1), &Event::HeartbeatReceived { coordinator: None }, 3, 9);
        let late = EventKey::new(Duration::from_secs(2), &Event::SweepTimer, 0, 1);
        assert!(early < late);
    }

    #[test]
    fn test_priority_orders_same_instant() {
        let now = Duration::from_secs(5);
        let internal = EventKey::new(
            now,
            &Event::StoppingEntered { reasons: vec![] },
            7,
            100,
        );
        let timer = EventKey::new(now, &Event::SweepTimer, 0, 1);
        let network = EventKey::new(now, &Event::HeartbeatReceived { coordinator: None }, 0, 2);

        assert!(internal < timer, "internal consequences pop first");
        assert!(timer < network);
    }

    #[test]
    fn test_sequence_breaks_full_ties() {
        let now = Duration::from_secs(5);
        let first = EventKey::new(now, &Event::SweepTimer, 1, 10);
        let second = EventKey::new(now, &Event::SweepTimer, 1, 11);
        assert!(first < second);
    }
}
