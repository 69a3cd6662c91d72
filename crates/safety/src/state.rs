//! Safety evaluator sub-state machine.

use gridmesh_core::Action;
use gridmesh_messages::FaultReportBroadcast;
use gridmesh_types::{
    DealLedger, FaultCategory, FaultRecord, FaultScope, FaultSeverity, Policy, TelemetrySnapshot,
    UnitId,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Global safety evaluator (coordinator only).
#[derive(Debug)]
pub struct SafetyState {
    unit_id: UnitId,
    is_coordinator: bool,

    /// Expected cluster membership.
    members: BTreeSet<UnitId>,

    /// Allowed grid current contribution per interchange-involved unit,
    /// in amperes.
    per_unit_allowance: f64,

    /// Device checks are suspended during a reference handover.
    suppressed: bool,

    /// Consecutive snapshots over the current budget.
    budget_breach_streak: u32,

    /// Current time.
    now: Duration,

    stats: SafetyStats,
}

/// Statistics from the safety evaluator for metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyStats {
    /// Snapshots evaluated.
    pub snapshots_evaluated: u64,
    /// Snapshots with membership mismatches.
    pub membership_mismatches: u64,
    /// Snapshots over the current budget.
    pub budget_breaches: u64,
    /// Snapshots with zero or multiple voltage references.
    pub reference_anomalies: u64,
}

impl SafetyState {
    pub fn new(unit_id: UnitId, policy: &Policy, is_coordinator: bool) -> Self {
        Self {
            unit_id,
            is_coordinator,
            members: policy.members.clone(),
            per_unit_allowance: policy.per_unit_allowance,
            suppressed: false,
            budget_breach_streak: 0,
            now: Duration::ZERO,
            stats: SafetyStats::default(),
        }
    }

    /// Evaluate one completed snapshot against the interchange ledger.
    pub fn on_snapshot(&mut self, snapshot: &TelemetrySnapshot, ledger: &DealLedger) -> Vec<Action> {
        if !self.is_coordinator {
            return vec![];
        }
        self.stats.snapshots_evaluated += 1;

        let mut actions = Vec::new();
        actions.extend(self.check_membership(snapshot));

        if self.suppressed {
            debug!("device checks suppressed during reference handover");
            return actions;
        }

        actions.extend(self.check_current_budget(snapshot, ledger));
        actions.extend(self.check_voltage_reference(snapshot));
        actions
    }

    /// Suspend or resume the device checks.
    pub fn set_suppressed(&mut self, suppressed: bool) {
        if self.suppressed != suppressed {
            debug!(suppressed, "safety device-check suppression changed");
        }
        self.suppressed = suppressed;
    }

    /// Give up the coordinator role.
    pub fn demote(&mut self) {
        self.is_coordinator = false;
    }

    /// Get statistics for metrics.
    pub fn stats(&self) -> SafetyStats {
        self.stats
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    /// Every configured member must appear in the snapshot. This check is
    /// never suppressed: losing a unit mid-handover is still losing a unit.
    fn check_membership(&mut self, snapshot: &TelemetrySnapshot) -> Vec<Action> {
        let reporting = snapshot.unit_ids();
        if reporting == self.members {
            return vec![];
        }

        self.stats.membership_mismatches += 1;
        let missing: Vec<UnitId> = self.members.difference(&reporting).copied().collect();
        let unexpected: Vec<UnitId> = reporting.difference(&self.members).copied().collect();
        warn!(?missing, ?unexpected, "snapshot membership mismatch");

        let mut message = String::from("snapshot membership mismatch");
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|u| u.to_string()).collect();
            message.push_str(&format!("; missing: {}", names.join(", ")));
        }
        if !unexpected.is_empty() {
            let names: Vec<String> = unexpected.iter().map(|u| u.to_string()).collect();
            message.push_str(&format!("; unexpected: {}", names.join(", ")));
        }

        vec![self.raise(FaultSeverity::Warn, message)]
    }

    /// The net grid current through the interchanging units must stay
    /// inside the budget scaled by how many distinct units take part.
    ///
    /// Only interchanges with both sides active count; a unit on several
    /// of them contributes its current once.
    fn check_current_budget(
        &mut self,
        snapshot: &TelemetrySnapshot,
        ledger: &DealLedger,
    ) -> Vec<Action> {
        let mut involved: BTreeSet<UnitId> = BTreeSet::new();
        for deal in ledger.iter().filter(|deal| deal.both_sides_active()) {
            involved.insert(deal.discharge_unit);
            involved.insert(deal.charge_unit);
        }

        let total: f64 = involved
            .iter()
            .filter_map(|unit| snapshot.units.get(unit))
            .map(|t| t.device.grid_current)
            .sum();
        let budget = self.per_unit_allowance * involved.len() as f64;

        if total.abs() <= budget {
            if self.budget_breach_streak > 0 {
                debug!(total, budget, "grid current back inside budget");
            }
            self.budget_breach_streak = 0;
            return vec![];
        }

        self.stats.budget_breaches += 1;
        self.budget_breach_streak += 1;
        let severity = if self.budget_breach_streak == 1 {
            FaultSeverity::Warn
        } else {
            FaultSeverity::Error
        };
        warn!(
            total,
            budget,
            streak = self.budget_breach_streak,
            "aggregate grid current outside budget"
        );

        vec![self.raise(
            severity,
            format!(
                "aggregate grid current {:.1} A outside budget {:.1} A across {} interchanging units",
                total,
                budget,
                involved.len()
            ),
        )]
    }

    /// Exactly one voltage reference keeps the grid defined. Zero is a
    /// grid without a voltage source; two or more fight each other.
    fn check_voltage_reference(&mut self, snapshot: &TelemetrySnapshot) -> Vec<Action> {
        let references = snapshot.voltage_references();
        match references.len() {
            1 => vec![],
            0 => {
                self.stats.reference_anomalies += 1;
                warn!("no voltage reference present in snapshot");
                vec![self.raise(
                    FaultSeverity::Warn,
                    "no voltage reference present in snapshot".to_string(),
                )]
            }
            _ => {
                self.stats.reference_anomalies += 1;
                let names: Vec<String> = references.iter().map(|u| u.to_string()).collect();
                warn!(references = ?names, "multiple voltage references present");
                vec![self.raise(
                    FaultSeverity::Error,
                    format!("multiple voltage references present: {}", names.join(", ")),
                )]
            }
        }
    }

    fn raise(&self, severity: FaultSeverity, message: String) -> Action {
        let fault = FaultRecord::new(
            FaultCategory::Hardware,
            FaultScope::Global,
            severity,
            self.unit_id,
            message,
            "coordinator.safety",
            self.now.as_millis() as u64,
        );
        Action::Broadcast {
            message: FaultReportBroadcast::new(fault).into(),
        }
    }
}
