//! Cluster-wide tunables.

use crate::UnitId;
use std::collections::BTreeSet;
use std::time::Duration;

/// The cluster's tunable configuration.
///
/// Components never read a live shared policy: each escalation sweep and each
/// safety check clones the current value up front, so a concurrent
/// configuration change cannot alter the semantics of an in-flight operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Unit ids expected to be present in the cluster.
    pub members: BTreeSet<UnitId>,

    /// How long `has_active_fault` keeps reporting true after an escalation
    /// completes.
    pub error_sustain: Duration,
    /// Period of the escalation dispatcher sweep.
    pub sweep_interval: Duration,
    /// Period of the coordinator uniqueness heartbeat.
    pub heartbeat_interval: Duration,
    /// Period of the telemetry collection timer.
    pub collection_interval: Duration,
    /// How long a collection round waits for stragglers.
    pub collection_timeout: Duration,
    /// Settle delay between the two scram broadcasts.
    pub scram_settle_delay: Duration,
    /// Poll period of the ask-and-wait-for-stop primitive.
    pub stop_poll_interval: Duration,
    /// Overall deadline of the ask-and-wait-for-stop primitive.
    pub stop_timeout: Duration,
    /// Timeout for a single request/reply exchange on the bus.
    pub request_timeout: Duration,

    /// Per-unit grid current allowance in amperes; the safety evaluator
    /// budgets `per_unit_allowance * distinct_units` across active deals.
    pub per_unit_allowance: f64,
    /// Nominal DC grid voltage setpoint in volts.
    pub grid_voltage_setpoint: f64,
    /// Droop ratio used while two units share voltage-setting during a
    /// handover. Must be non-zero for a handover to start.
    pub droop_ratio: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            members: BTreeSet::new(),
            error_sustain: Duration::from_millis(30_000),
            sweep_interval: Duration::from_millis(1_000),
            heartbeat_interval: Duration::from_millis(5_000),
            collection_interval: Duration::from_millis(5_000),
            collection_timeout: Duration::from_millis(2_000),
            scram_settle_delay: Duration::from_millis(5_000),
            stop_poll_interval: Duration::from_millis(1_000),
            stop_timeout: Duration::from_millis(60_000),
            request_timeout: Duration::from_millis(2_000),
            per_unit_allowance: 30.0,
            grid_voltage_setpoint: 380.0,
            droop_ratio: 0.2,
        }
    }
}

impl Policy {
    pub fn is_member(&self, unit: UnitId) -> bool {
        self.members.contains(&unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_periods() {
        let policy = Policy::default();
        assert_eq!(policy.error_sustain, Duration::from_secs(30));
        assert_eq!(policy.sweep_interval, Duration::from_secs(1));
        assert_eq!(policy.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(policy.collection_interval, Duration::from_secs(5));
        assert_eq!(policy.collection_timeout, Duration::from_secs(2));
        assert_eq!(policy.scram_settle_delay, Duration::from_secs(5));
        assert_eq!(policy.stop_poll_interval, Duration::from_secs(1));
        assert_eq!(policy.stop_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_membership() {
        let mut policy = Policy::default();
        policy.members.insert(UnitId(1));
        assert!(policy.is_member(UnitId(1)));
        assert!(!policy.is_member(UnitId(2)));
    }
}
