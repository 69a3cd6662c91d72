//! Request correlation and routing.

use gridmesh_types::UnitId;
use std::fmt;

/// Scope of the allocator runners use for ids attached to incoming
/// requests. Sub-machines allocate their own requests from lower scopes,
/// so an id's scope tells the composition root who owns it.
pub const INBOUND_SCOPE: u8 = 0xFF;

/// Correlates a request with its reply.
///
/// Ids are unique within one unit process. The requester allocates one per
/// `Action::Request`; incoming requests get one allocated by the runner so
/// the machine can answer via `Action::Reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Scope byte of the allocator that produced this id. Used to route a
    /// reply back to the sub-machine that owns the request.
    pub fn scope(&self) -> u8 {
        (self.0 >> 56) as u8
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Hands out process-unique request ids.
///
/// Each allocator is scoped: the scope occupies the top byte of the id,
/// so independently owned allocators (one per sub-machine, one in the
/// runner for incoming requests) never collide within a process.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    scope: u8,
    next: u64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scoped(scope: u8) -> Self {
        Self { scope, next: 0 }
    }

    pub fn next(&mut self) -> RequestId {
        let id = RequestId((self.scope as u64) << 56 | self.next);
        self.next += 1;
        id
    }
}

/// Which process serves an outbound request.
///
/// The request's logical address comes from its message type; the
/// destination only picks the process. `Coordinator` resolves to whichever
/// unit currently holds the role; if none does, the runner fails the
/// request as unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The current coordinator, whoever that is.
    Coordinator,
    /// A specific unit.
    Unit(UnitId),
    /// The external trading-layer process that owns interchange records.
    DealService,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Coordinator => f.write_str("coordinator"),
            Destination::Unit(unit) => write!(f, "{unit}"),
            Destination::DealService => f.write_str("deal-service"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_is_monotonic() {
        let mut alloc = RequestIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_scoped_allocators_never_collide() {
        let mut a = RequestIdAllocator::scoped(1);
        let mut b = RequestIdAllocator::scoped(2);
        let id_a = a.next();
        let id_b = b.next();
        assert_ne!(id_a, id_b);
        assert_eq!(id_a.scope(), 1);
        assert_eq!(id_b.scope(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(RequestId(7).to_string(), "req-7");
        assert_eq!(Destination::Coordinator.to_string(), "coordinator");
        assert_eq!(Destination::Unit(UnitId(3)).to_string(), "unit-3");
    }
}
