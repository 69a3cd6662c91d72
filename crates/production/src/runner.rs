//! Production runner implementation.
//!
//! Hosts one [`UnitStateMachine`] behind async I/O: the machine stays
//! synchronous and deterministic while the runner owns the clock, the
//! cluster bus, the timer wheel, and the device adapter. Events arrive
//! on one channel per priority class and a biased select keeps the
//! ordering the machine was designed for.

use crate::bus::{BusConfig, BusError, BusPeer, MessageBus};
use crate::device::DeviceAdapter;
use crate::metrics;
use crate::telemetry::ReadyFlag;
use crate::timers::TimerManager;

use gridmesh_aggregation::AggregationStats;
use gridmesh_core::{Action, Destination, Event, StateMachine};
use gridmesh_faults::FaultCollectorStats;
use gridmesh_handover::HandoverStats;
use gridmesh_helo::HeloStats;
use gridmesh_messages::RequestError;
use gridmesh_node::UnitStateMachine;
use gridmesh_recovery::RecoveryStats;
use gridmesh_safety::SafetyStats;
use gridmesh_types::{Policy, UnitId};

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, span, warn, Level};

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Handle for shutting down a running [`UnitRunner`].
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Why the event loop stopped.
///
/// `restart` mirrors the machine's `Action::Halt`: a supervisor is
/// expected to start a fresh process when it is set.
#[derive(Debug, Clone)]
pub struct RunnerExit {
    pub restart: bool,
    pub reasons: Vec<String>,
}

/// Builder for constructing a [`UnitRunner`].
///
/// Required fields:
/// - `unit_id` - This unit's cluster identity
/// - `policy` - Cluster policy shared by every member
/// - `bus_config` - Listen address and peer routes for the cluster bus
/// - `device` - Adapter for the local power conversion hardware
///
/// Optional fields:
/// - `coordinator` - Start in the coordinator role (defaults to false)
/// - `network_capacity` - Network/client channel capacity (defaults to 10,000)
/// - `status_interval` - Device status poll cadence (defaults to 1s)
/// - `ready_flag` - Readiness flag shared with the metrics server
pub struct UnitRunnerBuilder {
    unit_id: Option<UnitId>,
    policy: Option<Policy>,
    coordinator: bool,
    bus_config: Option<BusConfig>,
    device: Option<Arc<dyn DeviceAdapter>>,
    network_capacity: usize,
    status_interval: Duration,
    ready: Option<ReadyFlag>,
}

impl Default for UnitRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRunnerBuilder {
    pub fn new() -> Self {
        Self {
            unit_id: None,
            policy: None,
            coordinator: false,
            bus_config: None,
            device: None,
            network_capacity: 10_000,
            status_interval: Duration::from_secs(1),
            ready: None,
        }
    }

    /// Set this unit's cluster identity.
    pub fn unit_id(mut self, unit_id: UnitId) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    /// Set the cluster policy.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Start in the coordinator role.
    ///
    /// Exactly one unit per cluster is provisioned with this; the
    /// uniqueness guard resolves accidental doubles at runtime.
    pub fn coordinator(mut self, coordinator: bool) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Set the cluster bus configuration.
    pub fn bus_config(mut self, config: BusConfig) -> Self {
        self.bus_config = Some(config);
        self
    }

    /// Set the device adapter for the local hardware.
    pub fn device(mut self, device: Arc<dyn DeviceAdapter>) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the network and client channel capacity (default: 10,000).
    pub fn network_capacity(mut self, capacity: usize) -> Self {
        self.network_capacity = capacity;
        self
    }

    /// Set how often the device adapter is polled for status (default: 1s).
    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Share a readiness flag with the telemetry stack.
    ///
    /// The runner raises it once the machine is initialized and lowers
    /// it on exit, so `/ready` tracks the event loop.
    pub fn ready_flag(mut self, flag: ReadyFlag) -> Self {
        self.ready = Some(flag);
        self
    }

    /// Build the unit runner. Binds the bus listener.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing or the bus
    /// cannot bind its listen address.
    pub async fn build(self) -> Result<UnitRunner, RunnerError> {
        let unit_id = self.unit_id.ok_or(RunnerError::MissingField("unit_id"))?;
        let policy = self.policy.ok_or(RunnerError::MissingField("policy"))?;
        let bus_config = self
            .bus_config
            .ok_or(RunnerError::MissingField("bus_config"))?;
        let device = self.device.ok_or(RunnerError::MissingField("device"))?;

        // One channel per priority class, selected in EventPriority
        // order:
        // - internal_tx/rx: callbacks, self-delivered bus traffic, and
        //   reply resolution. Unbounded so the bus and the blocking
        //   device pool never stall delivering results.
        // - timer_tx/rx: expiries only. Small dedicated channel so a
        //   network flood cannot delay the sweep or heartbeat cadence.
        // - network_tx/rx: frames from peer units and the trading layer.
        // - client_tx/rx: operator and management traffic.
        let (timer_tx, timer_rx) = mpsc::channel(16);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (network_tx, network_rx) = mpsc::channel(self.network_capacity);
        let (client_tx, client_rx) = mpsc::channel(self.network_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let machine = UnitStateMachine::new(unit_id, &policy, self.coordinator);
        let timers = TimerManager::new(timer_tx);
        let bus = MessageBus::start(
            unit_id,
            bus_config,
            network_tx.clone(),
            internal_tx.clone(),
        )
        .await?;

        Ok(UnitRunner {
            machine,
            start_time: Instant::now(),
            timers,
            bus,
            device,
            internal_rx,
            internal_tx,
            timer_rx,
            network_rx,
            _network_tx: network_tx,
            client_rx,
            client_tx,
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
            ready: self.ready.unwrap_or_else(|| Arc::new(RwLock::new(false))),
            status_interval: self.status_interval,
            last_stats: MachineStats::default(),
            exit: None,
        })
    }
}

/// Last-synced copy of the machine's own counters.
///
/// The machines keep monotonic statistics; the runner exports them by
/// diffing against this copy so prometheus and the machines never
/// disagree.
#[derive(Debug, Clone, Copy, Default)]
struct MachineStats {
    helo: HeloStats,
    aggregation: AggregationStats,
    safety: SafetyStats,
    handover: HandoverStats,
    recovery: RecoveryStats,
    collector: FaultCollectorStats,
}

/// Production runner with async I/O.
///
/// Uses the event aggregator pattern: a single task owns the state
/// machine and receives events via per-priority mpsc channels.
///
/// Use [`UnitRunner::builder()`] to construct a runner with all
/// required dependencies, then spawn [`run`](UnitRunner::run).
pub struct UnitRunner {
    /// The state machine (owned, not shared).
    machine: UnitStateMachine,
    /// Start time for calculating elapsed duration.
    start_time: Instant,
    /// Timer manager for setting/cancelling timers.
    timers: TimerManager,
    /// Cluster bus for frames to and from peers.
    bus: Arc<MessageBus>,
    /// Adapter for the local power conversion hardware.
    device: Arc<dyn DeviceAdapter>,
    /// Receives highest-priority internal events (device callbacks,
    /// reply resolution, self-delivered broadcasts).
    internal_rx: mpsc::UnboundedReceiver<Event>,
    /// Clone this to send internal events from spawned work.
    internal_tx: mpsc::UnboundedSender<Event>,
    /// Receives timer expiries on their own channel.
    timer_rx: mpsc::Receiver<Event>,
    /// Receives network events decoded by the bus.
    network_rx: mpsc::Receiver<Event>,
    /// Keeps the network channel open when the bus is idle.
    _network_tx: mpsc::Sender<Event>,
    /// Receives lowest-priority client events.
    client_rx: mpsc::Receiver<Event>,
    /// Clone this to inject client events (operator tooling, tests).
    client_tx: mpsc::Sender<Event>,
    /// Shutdown signal receiver.
    shutdown_rx: oneshot::Receiver<()>,
    /// Shutdown handle sender (stored to return to caller).
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Raised while the event loop is live.
    ready: ReadyFlag,
    /// Device status poll cadence.
    status_interval: Duration,
    /// Counter snapshot for the metrics diff.
    last_stats: MachineStats,
    /// Set when a `Halt` action or shutdown signal ends the loop.
    exit: Option<(bool, Vec<String>)>,
}

impl UnitRunner {
    /// Create a new builder for constructing a unit runner.
    pub fn builder() -> UnitRunnerBuilder {
        UnitRunnerBuilder::new()
    }

    /// The cluster bus, for wiring peers discovered after startup.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Get a sender for injecting client-priority events.
    pub fn client_sender(&self) -> mpsc::Sender<Event> {
        self.client_tx.clone()
    }

    /// Take the shutdown handle.
    ///
    /// Returns a handle that when dropped triggers graceful shutdown.
    /// Can only be called once; subsequent calls return None.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Run the main event loop until shutdown or a `Halt` action.
    ///
    /// # Priority Handling
    ///
    /// Uses `biased` select so channels are always polled in priority
    /// order: shutdown, internal, timer, network, client. The network
    /// branch drains a small batch per poll so decoded frames that are
    /// already queued do not pay one select round trip each.
    pub async fn run(mut self) -> Result<RunnerExit, RunnerError> {
        const NETWORK_EVENT_BATCH: usize = 16;

        info!(
            unit = %self.machine.unit_id(),
            coordinator = self.machine.is_coordinator(),
            bus_addr = %self.bus.local_addr(),
            "starting unit runner"
        );

        // Boot the machine at t=0: claims or watches the coordinator
        // role and arms the periodic cadences.
        self.machine.set_time(self.start_time.elapsed());
        let actions = self.machine.initialize();
        self.process_actions(actions);

        // Feeds periodic LocalDeviceUpdated events so the machine's
        // device mirror tracks the hardware between commands. The first
        // sample lands right after startup.
        let sampler = spawn_device_sampler(
            self.device.clone(),
            self.internal_tx.clone(),
            self.status_interval,
        );

        let mut metrics_tick = tokio::time::interval(Duration::from_secs(1));
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        *self.ready.write() = true;

        while self.exit.is_none() {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("shutdown signal received");
                    self.exit = Some((false, vec!["shutdown requested".into()]));
                }

                Some(event) = self.internal_rx.recv() => {
                    self.dispatch_event(event);
                }

                Some(event) = self.timer_rx.recv() => {
                    self.dispatch_event(event);
                }

                Some(event) = self.network_rx.recv() => {
                    self.dispatch_event(event);
                    let mut drained = 1;
                    while drained < NETWORK_EVENT_BATCH && self.exit.is_none() {
                        match self.network_rx.try_recv() {
                            Ok(event) => {
                                self.dispatch_event(event);
                                drained += 1;
                            }
                            Err(_) => break,
                        }
                    }
                }

                Some(event) = self.client_rx.recv() => {
                    self.dispatch_event(event);
                }

                _ = metrics_tick.tick() => {
                    self.sync_stats();
                }
            }
        }

        sampler.abort();
        self.timers.cancel_all();
        self.sync_stats();
        *self.ready.write() = false;

        // The loop only breaks after `exit` is set.
        let (restart, reasons) = self.exit.take().unwrap_or((false, vec![]));
        info!(restart, ?reasons, "unit runner stopped");
        Ok(RunnerExit { restart, reasons })
    }

    /// Advance the clock, run one event through the machine, and
    /// execute the actions it caused.
    fn dispatch_event(&mut self, event: Event) {
        let event_type = event.type_name();
        let event_span = span!(
            Level::INFO,
            "handle_event",
            event.type = %event_type,
            unit = %self.machine.unit_id(),
        );
        let _event_guard = event_span.enter();

        self.machine.set_time(self.start_time.elapsed());

        let handle_start = Instant::now();
        let actions = self.machine.handle(event);
        metrics::record_event_processed(event_type, handle_start.elapsed().as_secs_f64());

        if !actions.is_empty() {
            debug!(
                event = event_type,
                num_actions = actions.len(),
                "event produced actions"
            );
        }

        self.process_actions(actions);
    }

    fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            metrics::record_action(action.type_name());
            self.process_action(action);
        }
    }

    fn process_action(&mut self, action: Action) {
        match action {
            Action::Broadcast { mut message } => {
                message.inject_trace_context();
                self.bus.publish(message);
            }

            Action::Send { to, message } => {
                self.bus.send(to, message);
            }

            Action::Request {
                to,
                request,
                request_id,
                timeout,
            } => match self.resolve_destination(to) {
                Some(peer) => self.bus.request(peer, request, request_id, timeout),
                None => {
                    // Exactly one ReplyReceived per request: fail it now
                    // instead of leaving the machine to wait out the
                    // timeout it never armed.
                    let _ = self.internal_tx.send(Event::ReplyReceived {
                        request_id,
                        outcome: Err(RequestError::unreachable("no coordinator observed")),
                    });
                }
            },

            Action::Reply {
                request_id,
                outcome,
            } => {
                self.bus.reply(request_id, outcome);
            }

            Action::SetTimer { id, duration } => {
                self.timers.set(id, duration);
            }

            Action::CancelTimer { id } => {
                self.timers.cancel(id);
            }

            Action::EnqueueInternal { event } => {
                let _ = self.internal_tx.send(event);
            }

            // Device calls may touch a fieldbus, so they run on the
            // blocking pool and come back as a callback event.
            Action::ExecuteDeviceCommand {
                request_id,
                command,
            } => {
                let device = self.device.clone();
                let internal_tx = self.internal_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let result = device
                        .execute(&command)
                        .map_err(|device_error| device_error.to_string());
                    let _ = internal_tx.send(Event::DeviceCommandCompleted { request_id, result });
                });
            }

            Action::Halt { restart, reasons } => {
                warn!(restart, ?reasons, "halt requested");
                self.exit = Some((restart, reasons));
            }
        }
    }

    /// Map a logical destination to a bus peer.
    ///
    /// `Coordinator` resolves through the uniqueness guard: this unit
    /// when it holds the role, otherwise whoever the last heartbeat
    /// named. `None` means nobody has claimed the role yet.
    fn resolve_destination(&self, to: Destination) -> Option<BusPeer> {
        match to {
            Destination::Unit(unit) => Some(BusPeer::Unit(unit)),
            Destination::DealService => Some(BusPeer::DealService),
            Destination::Coordinator => {
                if self.machine.is_coordinator() {
                    Some(BusPeer::Unit(self.machine.unit_id()))
                } else {
                    self.machine
                        .helo()
                        .observed_coordinator()
                        .map(BusPeer::Unit)
                }
            }
        }
    }

    /// Export the machine's counters as prometheus deltas.
    fn sync_stats(&mut self) {
        let helo = self.machine.helo().stats();
        let aggregation = self.machine.aggregation().stats();
        let safety = self.machine.safety().stats();
        let handover = self.machine.handover().stats();
        let recovery = self.machine.recovery().stats();
        let collector = self.machine.recovery().collector_stats();
        let last = self.last_stats;

        let m = metrics::metrics();
        m.heartbeats_published
            .inc_by((helo.heartbeats_published - last.helo.heartbeats_published) as f64);
        m.coordinator_conflicts
            .inc_by((helo.conflicts_detected - last.helo.conflicts_detected) as f64);
        m.snapshots_evaluated
            .inc_by((safety.snapshots_evaluated - last.safety.snapshots_evaluated) as f64);
        m.dispatcher_sweeps
            .inc_by((recovery.sweeps - last.recovery.sweeps) as f64);
        m.recovery_sequences
            .inc_by((recovery.sequences_run - last.recovery.sequences_run) as f64);
        m.recovery_secondary_faults
            .inc_by((recovery.secondary_faults - last.recovery.secondary_faults) as f64);

        metrics::record_aggregation_rounds(
            "completed",
            aggregation.rounds_completed - last.aggregation.rounds_completed,
        );
        metrics::record_aggregation_rounds(
            "timed_out",
            aggregation.rounds_timed_out - last.aggregation.rounds_timed_out,
        );
        metrics::record_aggregation_rounds(
            "empty",
            aggregation.rounds_empty - last.aggregation.rounds_empty,
        );
        metrics::record_stray_replies(
            "stale",
            aggregation.stale_replies - last.aggregation.stale_replies,
        );
        metrics::record_stray_replies(
            "non_member",
            aggregation.non_member_replies - last.aggregation.non_member_replies,
        );
        metrics::record_safety_violations(
            "membership",
            safety.membership_mismatches - last.safety.membership_mismatches,
        );
        metrics::record_safety_violations(
            "budget",
            safety.budget_breaches - last.safety.budget_breaches,
        );
        metrics::record_safety_violations(
            "reference",
            safety.reference_anomalies - last.safety.reference_anomalies,
        );
        metrics::record_handovers(
            "completed",
            handover.transfers_completed - last.handover.transfers_completed,
        );
        metrics::record_handovers(
            "aborted",
            handover.transfers_aborted - last.handover.transfers_aborted,
        );
        metrics::record_handovers(
            "refused",
            handover.transfers_refused - last.handover.transfers_refused,
        );
        metrics::record_faults(
            "retained",
            collector.faults_retained - last.collector.faults_retained,
        );
        metrics::record_faults(
            "advisory",
            collector.faults_advisory - last.collector.faults_advisory,
        );
        metrics::record_faults(
            "duplicate",
            collector.duplicates_suppressed - last.collector.duplicates_suppressed,
        );

        metrics::set_unit_status(
            self.machine.is_coordinator(),
            self.machine.recovery().has_active_fault(),
            self.machine.ledger().len(),
        );

        self.last_stats = MachineStats {
            helo,
            aggregation,
            safety,
            handover,
            recovery,
            collector,
        };
    }
}

/// Poll the device adapter on a fixed cadence and feed the samples back
/// as internal events. The first tick completes immediately.
fn spawn_device_sampler(
    device: Arc<dyn DeviceAdapter>,
    internal_tx: mpsc::UnboundedSender<Event>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let device = device.clone();
            match tokio::task::spawn_blocking(move || device.status()).await {
                Ok(Ok(status)) => {
                    if internal_tx
                        .send(Event::LocalDeviceUpdated { status })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Err(device_error)) => {
                    warn!(%device_error, "device status poll failed");
                }
                Err(join_error) => {
                    warn!(%join_error, "device status poll panicked");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;
    use gridmesh_types::test_utils::test_policy;
    use tokio::time::timeout;

    async fn build_runner(unit: u64, coordinator: bool) -> UnitRunner {
        UnitRunner::builder()
            .unit_id(UnitId(unit))
            .policy(test_policy(&[unit]))
            .coordinator(coordinator)
            .bus_config(BusConfig::default())
            .device(Arc::new(LoopbackDevice::new()))
            .build()
            .await
            .expect("runner should build")
    }

    #[tokio::test]
    async fn test_builder_rejects_missing_unit_id() {
        let result = UnitRunner::builder()
            .policy(test_policy(&[0]))
            .bus_config(BusConfig::default())
            .device(Arc::new(LoopbackDevice::new()))
            .build()
            .await;

        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("runner built without a unit id"),
        };
        assert!(matches!(err, RunnerError::MissingField("unit_id")));
        assert_eq!(err.to_string(), "unit_id is required");
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_runner() {
        let mut runner = build_runner(0, true).await;
        let handle = runner.shutdown_handle().expect("first take");
        assert!(runner.shutdown_handle().is_none(), "handle is take-once");

        let task = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();

        let exit = timeout(Duration::from_secs(2), task)
            .await
            .expect("runner should stop")
            .expect("runner task should not panic")
            .expect("run should succeed");
        assert!(!exit.restart);
        assert_eq!(exit.reasons, vec!["shutdown requested".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_handle_stops_runner() {
        let mut runner = build_runner(0, false).await;
        let handle = runner.shutdown_handle().expect("handle");

        let task = tokio::spawn(runner.run());
        drop(handle);

        let exit = timeout(Duration::from_secs(2), task)
            .await
            .expect("runner should stop")
            .expect("runner task should not panic")
            .expect("run should succeed");
        assert!(!exit.restart);
    }

    #[tokio::test]
    async fn test_cluster_reset_exits_with_restart() {
        let mut runner = build_runner(0, true).await;
        let keep_alive = runner.shutdown_handle().expect("handle");
        let client = runner.client_sender();

        let task = tokio::spawn(runner.run());
        client
            .send(Event::ResetAllReceived {
                reasons: vec!["operator reset".into()],
            })
            .await
            .expect("client channel open");

        let exit = timeout(Duration::from_secs(2), task)
            .await
            .expect("runner should stop")
            .expect("runner task should not panic")
            .expect("run should succeed");
        assert!(exit.restart);
        assert_eq!(exit.reasons, vec!["operator reset".to_string()]);
        drop(keep_alive);
    }

    #[tokio::test]
    async fn test_ready_flag_tracks_runner_lifecycle() {
        let ready: ReadyFlag = Arc::new(RwLock::new(false));
        let mut runner = UnitRunner::builder()
            .unit_id(UnitId(0))
            .policy(test_policy(&[0]))
            .coordinator(true)
            .bus_config(BusConfig::default())
            .device(Arc::new(LoopbackDevice::new()))
            .ready_flag(ready.clone())
            .build()
            .await
            .expect("runner should build");
        let handle = runner.shutdown_handle().expect("handle");

        let task = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(*ready.read(), "ready while the loop is live");

        handle.shutdown();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("runner should stop")
            .expect("runner task should not panic")
            .expect("run should succeed");
        assert!(!*ready.read(), "not ready after exit");
    }
}
