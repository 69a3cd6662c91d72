//! Uniqueness guard sub-state machine.

use gridmesh_core::{Action, Event, SubStateMachine, TimerId};
use gridmesh_messages::{FaultReportBroadcast, HeartbeatBroadcast};
use gridmesh_types::{
    FaultCategory, FaultRecord, FaultScope, FaultSeverity, Policy, UnitId,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Coordinator uniqueness guard.
///
/// While this unit holds the coordinator role it claims the role on the
/// heartbeat address every interval and answers queries immediately. A
/// claim carrying any other unit's identity means two coordinators are
/// live at once; that raises a global logic fault and nothing else. The
/// escalation dispatcher owns the consequences.
#[derive(Debug)]
pub struct HeloState {
    /// This unit's identity.
    unit_id: UnitId,

    /// Whether this unit currently holds the coordinator role.
    is_coordinator: bool,

    /// Interval between heartbeat claims.
    heartbeat_interval: Duration,

    /// Last coordinator identity heard on the heartbeat address.
    observed: Option<UnitId>,

    /// Current time.
    now: Duration,

    stats: HeloStats,
}

/// Statistics from the uniqueness guard for metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeloStats {
    /// Heartbeat claims published.
    pub heartbeats_published: u64,
    /// Conflicting coordinator claims detected.
    pub conflicts_detected: u64,
}

impl HeloState {
    pub fn new(unit_id: UnitId, policy: &Policy, is_coordinator: bool) -> Self {
        Self {
            unit_id,
            is_coordinator,
            heartbeat_interval: policy.heartbeat_interval,
            observed: None,
            now: Duration::ZERO,
            stats: HeloStats::default(),
        }
    }

    /// Startup actions.
    ///
    /// A coordinator claims the role immediately and arms the heartbeat
    /// timer. Everyone else publishes the query form so the current
    /// coordinator identifies itself.
    pub fn initialize(&mut self) -> Vec<Action> {
        if self.is_coordinator {
            info!(unit = %self.unit_id, "claiming coordinator role");
            let mut actions = self.claim();
            actions.push(Action::SetTimer {
                id: TimerId::Heartbeat,
                duration: self.heartbeat_interval,
            });
            actions
        } else {
            debug!(unit = %self.unit_id, "querying for current coordinator");
            vec![Action::Broadcast {
                message: HeartbeatBroadcast::query().into(),
            }]
        }
    }

    /// Called when a heartbeat arrives on the shared address.
    pub fn on_heartbeat(&mut self, coordinator: Option<UnitId>) -> Vec<Action> {
        let Some(claimed) = coordinator else {
            // Query form: only the coordinator answers.
            if self.is_coordinator {
                return self.claim();
            }
            return vec![];
        };

        self.observed = Some(claimed);

        if !self.is_coordinator || claimed == self.unit_id {
            return vec![];
        }

        // Another unit claims the role this unit holds.
        self.stats.conflicts_detected += 1;
        error!(
            unit = %self.unit_id,
            claimant = %claimed,
            "conflicting coordinator claim heard on heartbeat address"
        );

        let fault = FaultRecord::new(
            FaultCategory::Logic,
            FaultScope::Global,
            FaultSeverity::Error,
            self.unit_id,
            format!(
                "coordinator role claimed by {claimed} while {} holds it",
                self.unit_id
            ),
            "coordinator.uniqueness",
            self.now.as_millis() as u64,
        );
        vec![Action::Broadcast {
            message: FaultReportBroadcast::new(fault).into(),
        }]
    }

    /// Called when the heartbeat timer fires.
    ///
    /// A timer that outlived a demotion is stale and must not re-arm.
    pub fn on_heartbeat_timer(&mut self) -> Vec<Action> {
        if !self.is_coordinator {
            return vec![];
        }
        let mut actions = self.claim();
        actions.push(Action::SetTimer {
            id: TimerId::Heartbeat,
            duration: self.heartbeat_interval,
        });
        actions
    }

    /// Give up the coordinator role.
    pub fn demote(&mut self, reasons: &[String]) -> Vec<Action> {
        if !self.is_coordinator {
            return vec![];
        }
        warn!(unit = %self.unit_id, ?reasons, "demoting from coordinator role");
        self.is_coordinator = false;
        vec![Action::CancelTimer {
            id: TimerId::Heartbeat,
        }]
    }

    /// Whether this unit currently holds the coordinator role.
    pub fn is_coordinator(&self) -> bool {
        self.is_coordinator
    }

    /// Last coordinator identity heard on the heartbeat address.
    pub fn observed_coordinator(&self) -> Option<UnitId> {
        self.observed
    }

    /// Get statistics for metrics.
    pub fn stats(&self) -> HeloStats {
        self.stats
    }

    fn claim(&mut self) -> Vec<Action> {
        self.stats.heartbeats_published += 1;
        vec![Action::Broadcast {
            message: HeartbeatBroadcast::claim(self.unit_id).into(),
        }]
    }
}

impl SubStateMachine for HeloState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::HeartbeatReceived { coordinator } => Some(self.on_heartbeat(*coordinator)),
            Event::HeartbeatTimer => Some(self.on_heartbeat_timer()),
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmesh_core::OutboundMessage;

    fn guard(unit: u64, coordinator: bool) -> HeloState {
        HeloState::new(UnitId(unit), &Policy::default(), coordinator)
    }

    fn published_claim(actions: &[Action]) -> Option<Option<UnitId>> {
        actions.iter().find_map(|action| match action {
            Action::Broadcast {
                message: OutboundMessage::Heartbeat(hb),
            } => Some(hb.coordinator),
            _ => None,
        })
    }

    fn published_fault(actions: &[Action]) -> Option<&FaultRecord> {
        actions.iter().find_map(|action| match action {
            Action::Broadcast {
                message: OutboundMessage::FaultReport(report),
            } => Some(report.fault()),
            _ => None,
        })
    }

    #[test]
    fn test_coordinator_claims_and_arms_timer_on_startup() {
        let mut guard = guard(1, true);
        let actions = guard.initialize();

        assert_eq!(published_claim(&actions), Some(Some(UnitId(1))));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Heartbeat,
                ..
            }
        )));
    }

    #[test]
    fn test_non_coordinator_queries_on_startup() {
        let mut guard = guard(2, false);
        let actions = guard.initialize();

        assert_eq!(published_claim(&actions), Some(None), "expected query form");
    }

    #[test]
    fn test_timer_republishes_while_coordinator() {
        let mut guard = guard(1, true);
        let actions = guard.on_heartbeat_timer();

        assert_eq!(published_claim(&actions), Some(Some(UnitId(1))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { .. })));
    }

    #[test]
    fn test_stale_timer_after_demotion_does_nothing() {
        let mut guard = guard(1, true);
        guard.demote(&["operator request".into()]);

        assert!(guard.on_heartbeat_timer().is_empty());
        assert!(!guard.is_coordinator());
    }

    #[test]
    fn test_own_claim_is_ignored() {
        let mut guard = guard(1, true);
        let actions = guard.on_heartbeat(Some(UnitId(1)));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_conflicting_claim_raises_global_logic_fault() {
        let mut guard = guard(1, true);
        guard.set_time(Duration::from_secs(10));

        let actions = guard.on_heartbeat(Some(UnitId(9)));
        let fault = published_fault(&actions).expect("fault broadcast");

        assert_eq!(fault.category, FaultCategory::Logic);
        assert_eq!(fault.scope, FaultScope::Global);
        assert_eq!(fault.severity, FaultSeverity::Error);
        assert_eq!(fault.origin_unit_id, UnitId(1));
        assert_eq!(guard.stats().conflicts_detected, 1);
    }

    #[test]
    fn test_query_answered_only_by_coordinator() {
        let mut coordinator = guard(1, true);
        let actions = coordinator.on_heartbeat(None);
        assert_eq!(published_claim(&actions), Some(Some(UnitId(1))));

        let mut bystander = guard(2, false);
        assert!(bystander.on_heartbeat(None).is_empty());
    }

    #[test]
    fn test_foreign_claim_observed_but_not_faulted_when_not_coordinator() {
        let mut bystander = guard(2, false);
        let actions = bystander.on_heartbeat(Some(UnitId(1)));

        assert!(actions.is_empty());
        assert_eq!(bystander.observed_coordinator(), Some(UnitId(1)));
    }
}
