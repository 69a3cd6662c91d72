//! Per-unit fault store.

use gridmesh_types::{FaultCategory, FaultRecord, FaultScope, FaultSeverity, Policy, UnitId};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Holds the faults this unit has retained but not yet handled, plus the
/// bookkeeping behind `has_active_fault`.
#[derive(Debug)]
pub struct FaultCollector {
    unit_id: UnitId,
    is_coordinator: bool,

    /// How long `has_active_fault` stays true after handling completes.
    error_sustain: Duration,

    /// Retained faults in arrival order. Drained cell by cell.
    queued: Vec<FaultRecord>,

    /// Set when a fault is retained, cleared by `mark_handled`. Stays set
    /// while the dispatcher is mid-sweep so the unit never looks healthy
    /// between drain and completion.
    pending: bool,

    /// When the most recent handling completed.
    handled_at: Option<Duration>,

    stats: FaultCollectorStats,
}

/// Statistics from the fault collector for metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultCollectorStats {
    /// Faults retained for escalation.
    pub faults_retained: u64,
    /// Advisory (WARN) faults logged and dropped.
    pub faults_advisory: u64,
    /// Faults observed but belonging to another unit or role.
    pub faults_observed: u64,
    /// Exact duplicates already queued when recorded again.
    pub duplicates_suppressed: u64,
}

impl FaultCollector {
    pub fn new(unit_id: UnitId, policy: &Policy, is_coordinator: bool) -> Self {
        Self {
            unit_id,
            is_coordinator,
            error_sustain: policy.error_sustain,
            queued: Vec::new(),
            pending: false,
            handled_at: None,
            stats: FaultCollectorStats::default(),
        }
    }

    /// Record one observed fault. Returns true when the fault was retained
    /// for escalation on this unit.
    pub fn record(&mut self, fault: FaultRecord) -> bool {
        if fault.is_warn() {
            warn!(%fault, "advisory fault");
            self.stats.faults_advisory += 1;
            return false;
        }

        match fault.scope {
            FaultScope::Local if fault.origin_unit_id != self.unit_id => {
                debug!(%fault, "local fault from another unit, not retained");
                self.stats.faults_observed += 1;
                return false;
            }
            FaultScope::Global if !self.is_coordinator => {
                debug!(%fault, "global fault observed, retained by the coordinator");
                self.stats.faults_observed += 1;
                return false;
            }
            _ => {}
        }

        if self.queued.iter().any(|queued| queued == &fault) {
            debug!(%fault, "duplicate fault already queued");
            self.stats.duplicates_suppressed += 1;
            return false;
        }

        error!(%fault, "fault retained for escalation");
        self.stats.faults_retained += 1;
        self.queued.push(fault);
        self.pending = true;
        true
    }

    /// True while any fault is queued or being handled, or within the
    /// sustain window after the last handling completed.
    pub fn has_active_fault(&self, now: Duration) -> bool {
        if self.pending {
            return true;
        }
        self.handled_at
            .is_some_and(|at| now < at + self.error_sustain)
    }

    /// Remove and return every queued fault for one cell of the category
    /// and severity cross product, preserving arrival order.
    pub fn drain(&mut self, category: FaultCategory, severity: FaultSeverity) -> Vec<FaultRecord> {
        let mut drained = Vec::new();
        let mut kept = Vec::with_capacity(self.queued.len());
        for fault in self.queued.drain(..) {
            if fault.category == category && fault.severity == severity {
                drained.push(fault);
            } else {
                kept.push(fault);
            }
        }
        self.queued = kept;
        drained
    }

    /// Handling finished: clear the pending flag and start the sustain
    /// window. A no-op when nothing was pending.
    pub fn mark_handled(&mut self, now: Duration) {
        if !self.pending {
            return;
        }
        self.pending = false;
        self.handled_at = Some(now);
        debug!(sustain = ?self.error_sustain, "fault handling complete, sustain window started");
    }

    /// Number of retained faults awaiting a sweep.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Give up the coordinator role. Queued global faults are discarded;
    /// a condition that persists will be re-raised and retained by the
    /// new coordinator.
    pub fn demote(&mut self) {
        self.is_coordinator = false;
        let before = self.queued.len();
        self.queued.retain(|fault| fault.scope == FaultScope::Local);
        let discarded = before - self.queued.len();
        if discarded > 0 {
            warn!(discarded, "dropped queued global faults on demotion");
        }
        if self.queued.is_empty() && discarded > 0 && self.pending {
            // Nothing left for the dispatcher; do not hold the unit in the
            // pending state for faults it will never handle.
            self.pending = false;
        }
    }

    /// Get statistics for metrics.
    pub fn stats(&self) -> FaultCollectorStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(is_coordinator: bool) -> FaultCollector {
        FaultCollector::new(UnitId(1), &Policy::default(), is_coordinator)
    }

    fn fault(
        category: FaultCategory,
        scope: FaultScope,
        severity: FaultSeverity,
        origin: u64,
        message: &str,
    ) -> FaultRecord {
        FaultRecord::new(
            category,
            scope,
            severity,
            UnitId(origin),
            message.to_string(),
            "test.site".to_string(),
            0,
        )
    }

    #[test]
    fn test_warn_is_never_retained() {
        let mut c = collector(true);
        let retained = c.record(fault(
            FaultCategory::Hardware,
            FaultScope::Global,
            FaultSeverity::Warn,
            1,
            "soft condition",
        ));
        assert!(!retained);
        assert!(!c.has_active_fault(Duration::ZERO));
        assert_eq!(c.stats().faults_advisory, 1);
    }

    #[test]
    fn test_own_local_error_is_retained() {
        let mut c = collector(false);
        assert!(c.record(fault(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Error,
            1,
            "converter fault",
        )));
        assert!(c.has_active_fault(Duration::ZERO));
        assert_eq!(c.queued_len(), 1);
    }

    #[test]
    fn test_foreign_local_fault_is_ignored() {
        let mut c = collector(false);
        assert!(!c.record(fault(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Error,
            2,
            "someone else's converter",
        )));
        assert!(c.is_empty());
        assert_eq!(c.stats().faults_observed, 1);
    }

    #[test]
    fn test_global_fault_retained_only_at_coordinator() {
        let global = fault(
            FaultCategory::Logic,
            FaultScope::Global,
            FaultSeverity::Error,
            3,
            "another coordinator exists",
        );

        let mut ordinary = collector(false);
        assert!(!ordinary.record(global.clone()));
        assert!(ordinary.is_empty());

        let mut coordinator = collector(true);
        assert!(coordinator.record(global));
        assert_eq!(coordinator.queued_len(), 1);
    }

    #[test]
    fn test_duplicate_while_queued_is_suppressed() {
        let mut c = collector(true);
        let f = fault(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Error,
            1,
            "same condition",
        );
        assert!(c.record(f.clone()));
        assert!(!c.record(f.clone()));
        assert_eq!(c.queued_len(), 1);
        assert_eq!(c.stats().duplicates_suppressed, 1);

        // Once drained, the condition firing again is a fresh fault.
        c.drain(FaultCategory::Hardware, FaultSeverity::Error);
        assert!(c.record(f));
    }

    #[test]
    fn test_drain_takes_only_the_requested_cell() {
        let mut c = collector(true);
        c.record(fault(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Error,
            1,
            "hw",
        ));
        c.record(fault(
            FaultCategory::Logic,
            FaultScope::Local,
            FaultSeverity::Error,
            1,
            "logic",
        ));
        c.record(fault(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Fatal,
            1,
            "hw fatal",
        ));

        let drained = c.drain(FaultCategory::Hardware, FaultSeverity::Error);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message, "hw");
        assert_eq!(c.queued_len(), 2);
    }

    #[test]
    fn test_pending_survives_drain_until_marked_handled() {
        let mut c = collector(true);
        c.record(fault(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Error,
            1,
            "hw",
        ));
        c.drain(FaultCategory::Hardware, FaultSeverity::Error);

        // Mid-sweep: queue is empty but the unit is still unhealthy.
        assert!(c.is_empty());
        assert!(c.has_active_fault(Duration::from_secs(1)));

        c.mark_handled(Duration::from_secs(2));
        // Inside the sustain window.
        assert!(c.has_active_fault(Duration::from_secs(2)));
        assert!(c.has_active_fault(Duration::from_secs(31)));
        // Default sustain is 30 s; one tick past the window clears it.
        assert!(!c.has_active_fault(Duration::from_secs(33)));
    }

    #[test]
    fn test_mark_handled_without_pending_is_a_no_op() {
        let mut c = collector(true);
        c.mark_handled(Duration::from_secs(5));
        assert!(!c.has_active_fault(Duration::from_secs(6)));
    }

    #[test]
    fn test_mark_handled_does_not_extend_window_when_idle() {
        let mut c = collector(true);
        c.record(fault(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Error,
            1,
            "hw",
        ));
        c.drain(FaultCategory::Hardware, FaultSeverity::Error);
        c.mark_handled(Duration::from_secs(10));

        // A later idle sweep must not restart the window.
        c.mark_handled(Duration::from_secs(35));
        assert!(!c.has_active_fault(Duration::from_secs(41)));
    }

    #[test]
    fn test_demotion_discards_global_but_keeps_local() {
        let mut c = collector(true);
        c.record(fault(
            FaultCategory::Logic,
            FaultScope::Global,
            FaultSeverity::Error,
            2,
            "global condition",
        ));
        c.record(fault(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Error,
            1,
            "own converter",
        ));

        c.demote();
        assert_eq!(c.queued_len(), 1);
        let drained = c.drain(FaultCategory::Hardware, FaultSeverity::Error);
        assert_eq!(drained[0].message, "own converter");
        assert!(c.has_active_fault(Duration::ZERO));
    }

    #[test]
    fn test_demotion_clears_pending_when_nothing_remains() {
        let mut c = collector(true);
        c.record(fault(
            FaultCategory::Logic,
            FaultScope::Global,
            FaultSeverity::Error,
            2,
            "global condition",
        ));
        c.demote();
        assert!(c.is_empty());
        assert!(!c.has_active_fault(Duration::ZERO));
    }
}
