//! Production metrics using native Prometheus client.
//!
//! Counters mirror the statistics the state machines already keep; the
//! runner feeds them by diffing those statistics after each event, so
//! the numbers here always agree with what the machines themselves
//! report. Label sets are static (event names, action names, bus
//! addresses), keeping cardinality bounded.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Event loop ===
    pub events_processed: CounterVec,
    pub actions_generated: CounterVec,
    pub event_handle_latency: Histogram,

    // === Coordination ===
    pub heartbeats_published: Counter,
    pub coordinator_conflicts: Counter,
    pub coordinator_role: Gauge,

    // === Telemetry rounds ===
    pub aggregation_rounds: CounterVec,
    pub stray_telemetry_replies: CounterVec,
    pub snapshots_evaluated: Counter,
    pub safety_violations: CounterVec,

    // === Faults and recovery ===
    pub faults_recorded: CounterVec,
    pub dispatcher_sweeps: Counter,
    pub recovery_sequences: Counter,
    pub recovery_secondary_faults: Counter,
    pub active_fault: Gauge,

    // === Handover ===
    pub handover_transfers: CounterVec,

    // === Deals ===
    pub active_deals: Gauge,

    // === Bus ===
    pub bus_messages_sent: CounterVec,
    pub bus_messages_received: CounterVec,
    pub requests_in_flight: Gauge,
}

impl Metrics {
    fn new() -> Self {
        // Handler latency buckets: 5µs to 50ms. Handlers are synchronous
        // and allocation-light, so anything past a few ms means trouble.
        let handle_buckets = vec![
            0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05,
        ];

        Self {
            // Event loop
            events_processed: register_counter_vec!(
                "gridmesh_events_processed_total",
                "Total events handled by the state machine",
                &["event"]
            )
            .unwrap(),

            actions_generated: register_counter_vec!(
                "gridmesh_actions_generated_total",
                "Total actions produced by the state machine",
                &["action"]
            )
            .unwrap(),

            event_handle_latency: register_histogram!(
                "gridmesh_event_handle_latency_seconds",
                "Time spent in one state-machine handle call",
                handle_buckets
            )
            .unwrap(),

            // Coordination
            heartbeats_published: register_counter!(
                "gridmesh_heartbeats_published_total",
                "Total coordinator heartbeats published by this unit"
            )
            .unwrap(),

            coordinator_conflicts: register_counter!(
                "gridmesh_coordinator_conflicts_total",
                "Total competing coordinator claims observed"
            )
            .unwrap(),

            coordinator_role: register_gauge!(
                "gridmesh_coordinator_role",
                "Whether this unit currently holds the coordinator role (0 or 1)"
            )
            .unwrap(),

            // Telemetry rounds
            aggregation_rounds: register_counter_vec!(
                "gridmesh_aggregation_rounds_total",
                "Total telemetry rounds by outcome",
                &["outcome"]
            )
            .unwrap(),

            stray_telemetry_replies: register_counter_vec!(
                "gridmesh_stray_telemetry_replies_total",
                "Telemetry replies discarded without entering a round",
                &["kind"]
            )
            .unwrap(),

            snapshots_evaluated: register_counter!(
                "gridmesh_snapshots_evaluated_total",
                "Total telemetry snapshots run through the safety checks"
            )
            .unwrap(),

            safety_violations: register_counter_vec!(
                "gridmesh_safety_violations_total",
                "Safety check findings by kind",
                &["kind"]
            )
            .unwrap(),

            // Faults and recovery
            faults_recorded: register_counter_vec!(
                "gridmesh_faults_recorded_total",
                "Fault reports by disposition",
                &["disposition"]
            )
            .unwrap(),

            dispatcher_sweeps: register_counter!(
                "gridmesh_dispatcher_sweeps_total",
                "Total recovery dispatcher sweeps"
            )
            .unwrap(),

            recovery_sequences: register_counter!(
                "gridmesh_recovery_sequences_total",
                "Total recovery sequences started"
            )
            .unwrap(),

            recovery_secondary_faults: register_counter!(
                "gridmesh_recovery_secondary_faults_total",
                "Faults raised because a recovery step itself failed"
            )
            .unwrap(),

            active_fault: register_gauge!(
                "gridmesh_active_fault",
                "Whether this unit has an unresolved retained fault (0 or 1)"
            )
            .unwrap(),

            // Handover
            handover_transfers: register_counter_vec!(
                "gridmesh_handover_transfers_total",
                "Voltage-reference transfers by outcome",
                &["outcome"]
            )
            .unwrap(),

            // Deals
            active_deals: register_gauge!(
                "gridmesh_active_deals",
                "Interchange deals currently tracked in the ledger"
            )
            .unwrap(),

            // Bus
            bus_messages_sent: register_counter_vec!(
                "gridmesh_bus_messages_sent_total",
                "Frames sent on the cluster bus by address",
                &["address"]
            )
            .unwrap(),

            bus_messages_received: register_counter_vec!(
                "gridmesh_bus_messages_received_total",
                "Frames received on the cluster bus by address",
                &["address"]
            )
            .unwrap(),

            requests_in_flight: register_gauge!(
                "gridmesh_requests_in_flight",
                "Outbound requests awaiting a reply or timeout"
            )
            .unwrap(),
        }
    }
}

/// Get or initialize the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Record one handled event with its handler latency.
pub fn record_event_processed(event_type: &str, latency_secs: f64) {
    let m = metrics();
    m.events_processed.with_label_values(&[event_type]).inc();
    m.event_handle_latency.observe(latency_secs);
}

/// Record one generated action.
pub fn record_action(action_type: &str) {
    metrics()
        .actions_generated
        .with_label_values(&[action_type])
        .inc();
}

/// Record a finished telemetry round.
///
/// **Cardinality control**: outcome must be one of `"completed"`,
/// `"timed_out"`, `"empty"`.
pub fn record_aggregation_rounds(outcome: &str, count: u64) {
    debug_assert!(
        matches!(outcome, "completed" | "timed_out" | "empty"),
        "Unknown round outcome: {}",
        outcome
    );
    metrics()
        .aggregation_rounds
        .with_label_values(&[outcome])
        .inc_by(count as f64);
}

/// Record fault reports by disposition.
///
/// **Cardinality control**: disposition must be one of `"retained"`,
/// `"advisory"`, `"duplicate"`.
pub fn record_faults(disposition: &str, count: u64) {
    debug_assert!(
        matches!(disposition, "retained" | "advisory" | "duplicate"),
        "Unknown fault disposition: {}",
        disposition
    );
    metrics()
        .faults_recorded
        .with_label_values(&[disposition])
        .inc_by(count as f64);
}

/// Record finished voltage-reference transfers.
///
/// **Cardinality control**: outcome must be one of `"completed"`,
/// `"aborted"`, `"refused"`.
pub fn record_handovers(outcome: &str, count: u64) {
    debug_assert!(
        matches!(outcome, "completed" | "aborted" | "refused"),
        "Unknown transfer outcome: {}",
        outcome
    );
    metrics()
        .handover_transfers
        .with_label_values(&[outcome])
        .inc_by(count as f64);
}

/// Record safety findings by kind.
///
/// **Cardinality control**: kind must be one of `"membership"`,
/// `"budget"`, `"reference"`.
pub fn record_safety_violations(kind: &str, count: u64) {
    debug_assert!(
        matches!(kind, "membership" | "budget" | "reference"),
        "Unknown safety violation kind: {}",
        kind
    );
    metrics()
        .safety_violations
        .with_label_values(&[kind])
        .inc_by(count as f64);
}

/// Record discarded telemetry replies by kind.
///
/// **Cardinality control**: kind must be one of `"stale"`, `"non_member"`.
pub fn record_stray_replies(kind: &str, count: u64) {
    debug_assert!(
        matches!(kind, "stale" | "non_member"),
        "Unknown stray reply kind: {}",
        kind
    );
    metrics()
        .stray_telemetry_replies
        .with_label_values(&[kind])
        .inc_by(count as f64);
}

/// Update the role and health gauges.
pub fn set_unit_status(coordinator: bool, active_fault: bool, active_deals: usize) {
    let m = metrics();
    m.coordinator_role.set(if coordinator { 1.0 } else { 0.0 });
    m.active_fault.set(if active_fault { 1.0 } else { 0.0 });
    m.active_deals.set(active_deals as f64);
}

/// Record a bus frame sent.
pub fn record_bus_sent(address: &str) {
    metrics()
        .bus_messages_sent
        .with_label_values(&[address])
        .inc();
}

/// Record a bus frame received.
pub fn record_bus_received(address: &str) {
    metrics()
        .bus_messages_received
        .with_label_values(&[address])
        .inc();
}
