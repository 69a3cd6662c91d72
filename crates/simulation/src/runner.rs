//! Deterministic simulation runner.
//!
//! Each unit has its own simulated device. When a unit emits
//! `Action::ExecuteDeviceCommand`, the runner calls that unit's device
//! inline (synchronously) and schedules the completion callback.
//!
//! Requests are correlated through a pending table: the runner schedules
//! the requester's timeout up front and the real reply races it. A
//! request or reply lost to a partition or packet loss surfaces at the
//! requester as `RequestError::timeout()`, exactly as a lossy bus would.

use crate::deal_service::{DealServiceConfig, SimulatedDealService};
use crate::device::SimulatedDevice;
use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;
use gridmesh_core::{
    timer_event, Action, Destination, Event, OutboundMessage, OutboundRequest, RequestId,
    RequestIdAllocator, StateMachine, TimerId, INBOUND_SCOPE,
};
use gridmesh_messages::{FaultReportBroadcast, RequestError, RequestOutcome};
use gridmesh_node::UnitStateMachine;
use gridmesh_types::{DealRecord, DeviceStatus, FaultRecord, Policy, UnitId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// One unit process plus the hardware it drives.
///
/// The machine and inbound allocator belong to the process and are
/// replaced on restart; the device is hardware and survives.
struct SimulatedUnit {
    unit_id: UnitId,
    machine: UnitStateMachine,
    device: SimulatedDevice,

    /// Allocates inbound ids for requests delivered to this unit.
    inbound: RequestIdAllocator,

    /// Role this unit is configured to come up with, restored on restart.
    configured_coordinator: bool,

    /// A halted unit drops everything addressed to it until it restarts.
    halted: bool,
}

/// A routed request waiting for its responder's `Action::Reply`.
///
/// Keyed in the pending table by `(responder index, inbound id)`.
struct PendingRequest {
    requester: NodeIndex,

    /// The requester's own id for this request, echoed in the reply event.
    request_id: RequestId,

    /// Replies arriving at or after this instant are abandoned.
    deadline: Duration,

    /// Synthetic timeout sitting in the queue at `deadline`, removed when
    /// the real reply wins the race.
    timeout_key: EventKey,
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
///
/// Units are separate processes that don't share state; the trading layer
/// is a separate endpoint occupying the last network index.
pub struct SimulationRunner {
    /// All units, indexed by `NodeIndex` in ascending unit-id order.
    units: Vec<SimulatedUnit>,

    /// Cluster policy every unit was configured with.
    policy: Policy,

    /// The trading layer, reachable as `Destination::DealService`.
    deal_service: SimulatedDealService,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,

    /// Sequence counter for deterministic ordering.
    sequence: u64,

    /// Current simulation time.
    now: Duration,

    /// Network simulator.
    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Timer registry for cancellation support.
    /// Maps (unit, timer_id) -> event_key for removal.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    /// In-flight requests keyed by (responder, inbound id).
    pending: HashMap<(NodeIndex, RequestId), PendingRequest>,

    /// Halted units waiting to come back, in restart-time order.
    pending_restarts: BTreeSet<(Duration, NodeIndex)>,

    /// Gap between a restarting halt and the fresh process coming up.
    restart_delay: Duration,

    /// Statistics.
    stats: SimulationStats,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Events discarded because their unit was halted.
    pub events_dropped_halted: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
    /// Requests whose request leg was scheduled at a responder.
    pub requests_routed: u64,
    /// Requests failed immediately because no endpoint serves them.
    pub requests_unroutable: u64,
    /// Replies that reached their requester before the timeout.
    pub replies_delivered: u64,
    /// Replies lost or too late; the requester saw a timeout instead.
    pub replies_abandoned: u64,
    /// Device commands executed.
    pub device_commands: u64,
    /// Units halted.
    pub halts: u64,
    /// Units restarted.
    pub restarts: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

impl SimulationRunner {
    /// Create a new simulation runner for the policy's membership.
    ///
    /// Units come up in ascending unit-id order; the lowest member id is
    /// configured as the coordinator. The trading layer occupies one extra
    /// network endpoint after the units.
    pub fn new(network_config: NetworkConfig, policy: Policy, seed: u64) -> Self {
        let unit_ids: Vec<UnitId> = policy.members.iter().copied().collect();
        let endpoints = unit_ids.len() as u32 + 1;
        let network = SimulatedNetwork::new(network_config, endpoints);
        let rng = ChaCha8Rng::seed_from_u64(seed);

        let coordinator = unit_ids.first().copied();
        let units: Vec<SimulatedUnit> = unit_ids
            .iter()
            .map(|&unit_id| SimulatedUnit {
                unit_id,
                machine: UnitStateMachine::new(unit_id, &policy, Some(unit_id) == coordinator),
                device: SimulatedDevice::new(),
                inbound: RequestIdAllocator::scoped(INBOUND_SCOPE),
                configured_coordinator: Some(unit_id) == coordinator,
                halted: false,
            })
            .collect();

        info!(
            units = units.len(),
            coordinator = ?coordinator,
            seed,
            "Created simulation runner"
        );

        Self {
            units,
            policy,
            deal_service: SimulatedDealService::new(DealServiceConfig::default()),
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network,
            rng,
            timers: HashMap::new(),
            pending: HashMap::new(),
            pending_restarts: BTreeSet::new(),
            restart_delay: Duration::from_secs(1),
            stats: SimulationStats::default(),
        }
    }

    /// Initialize all units and process their startup actions.
    ///
    /// The configured coordinator claims the role and arms its timers;
    /// members broadcast a coordinator query.
    pub fn initialize(&mut self) {
        for index in 0..self.units.len() as NodeIndex {
            let actions = self.units[index as usize].machine.initialize();
            self.stats.actions_generated += actions.len() as u64;
            for action in actions {
                self.process_action(index, action);
            }
        }
        info!(units = self.units.len(), "Initialized all units");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Get simulation statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Get current simulation time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Get a unit's state machine.
    ///
    /// For a halted unit this is the dead process's last state; check
    /// [`is_halted`](Self::is_halted) before reading through it.
    pub fn unit(&self, unit_id: UnitId) -> Option<&UnitStateMachine> {
        self.unit_index(unit_id)
            .map(|index| &self.units[index as usize].machine)
    }

    /// Index of a unit in deterministic order, if it is a member.
    pub fn unit_index(&self, unit_id: UnitId) -> Option<NodeIndex> {
        self.units
            .iter()
            .position(|unit| unit.unit_id == unit_id)
            .map(|index| index as NodeIndex)
    }

    /// All member unit ids in index order.
    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.iter().map(|unit| unit.unit_id).collect()
    }

    /// Network index of the trading layer.
    pub fn deal_service_index(&self) -> NodeIndex {
        self.units.len() as NodeIndex
    }

    /// The unit currently holding the coordinator role, if a live one
    /// claims it.
    pub fn coordinator(&self) -> Option<UnitId> {
        self.units
            .iter()
            .find(|unit| !unit.halted && unit.machine.is_coordinator())
            .map(|unit| unit.unit_id)
    }

    /// Whether a unit's process is currently down.
    pub fn is_halted(&self, unit_id: UnitId) -> bool {
        self.unit_index(unit_id)
            .map(|index| self.units[index as usize].halted)
            .unwrap_or(false)
    }

    /// What a unit's device currently reports.
    pub fn device_status(&self, unit_id: UnitId) -> Option<DeviceStatus> {
        self.unit_index(unit_id)
            .map(|index| self.units[index as usize].device.status())
    }

    /// Get a unit's simulated device.
    pub fn device(&self, unit_id: UnitId) -> Option<&SimulatedDevice> {
        self.unit_index(unit_id)
            .map(|index| &self.units[index as usize].device)
    }

    /// Get a unit's simulated device for failure injection.
    pub fn device_mut(&mut self, unit_id: UnitId) -> Option<&mut SimulatedDevice> {
        self.unit_index(unit_id)
            .map(|index| &mut self.units[index as usize].device)
    }

    /// Get the simulated trading layer.
    pub fn deal_service(&self) -> &SimulatedDealService {
        &self.deal_service
    }

    /// Get the trading layer for behavior configuration.
    pub fn deal_service_mut(&mut self) -> &mut SimulatedDealService {
        &mut self.deal_service
    }

    /// Get a reference to the network.
    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Get a mutable reference to the network for partition/loss
    /// configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Get the policy the cluster runs under.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Override the gap between a restarting halt and the fresh process.
    pub fn set_restart_delay(&mut self, delay: Duration) {
        self.restart_delay = delay;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scenario Drivers
    // ═══════════════════════════════════════════════════════════════════════

    /// Schedule an event for a unit (e.g. to drive a scenario).
    pub fn schedule_initial_event(&mut self, unit: UnitId, delay: Duration, event: Event) {
        let Some(index) = self.unit_index(unit) else {
            warn!(%unit, "schedule_initial_event for unknown unit ignored");
            return;
        };
        let time = self.now + delay;
        self.schedule_event(index, time, event);
    }

    /// Register a deal with the trading layer and announce it to the units.
    pub fn register_deal(&mut self, deal: DealRecord) {
        let broadcast = self.deal_service.register(deal);
        self.broadcast_from_service_at(self.now, broadcast.into());
    }

    /// Publish a deal update from the trading layer.
    pub fn update_deal(&mut self, deal: DealRecord) {
        let broadcast = self.deal_service.update(deal);
        self.broadcast_from_service_at(self.now, broadcast.into());
    }

    /// Publish a fault report from a unit on the cluster-wide fault
    /// address. The origin hears its own report, like every broadcast.
    pub fn broadcast_fault(&mut self, from: UnitId, fault: FaultRecord) {
        let Some(index) = self.unit_index(from) else {
            warn!(%from, "broadcast_fault for unknown unit ignored");
            return;
        };
        self.process_action(
            index,
            Action::Broadcast {
                message: FaultReportBroadcast::new(fault).into(),
            },
        );
    }

    /// Ask the coordinator to move the voltage-reference role.
    pub fn request_handover(&mut self, from: UnitId, to: UnitId) {
        let Some(index) = self.live_coordinator_index() else {
            warn!("request_handover with no live coordinator ignored");
            return;
        };
        self.schedule_event(index, self.now, Event::HandoverRequested { from, to });
    }

    /// Overwrite a device's reported status and notify its unit, the way
    /// the device listener pushes unsolicited updates.
    pub fn set_device_status(&mut self, unit_id: UnitId, status: DeviceStatus) {
        let Some(index) = self.unit_index(unit_id) else {
            warn!(%unit_id, "set_device_status for unknown unit ignored");
            return;
        };
        self.units[index as usize].device.set_status(status);
        self.schedule_event(index, self.now, Event::LocalDeviceUpdated { status });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event Loop
    // ═══════════════════════════════════════════════════════════════════════

    /// Run simulation for a duration from the current time.
    pub fn run_for(&mut self, duration: Duration) {
        let end_time = self.now + duration;
        self.run_until(end_time);
    }

    /// Run simulation until no more events or the time limit is reached.
    pub fn run_until(&mut self, end_time: Duration) {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );

        loop {
            let next_event = self.event_queue.first_key_value().map(|(key, _)| key.time);
            let next_restart = self.pending_restarts.first().copied();

            // Restarts interleave with the event queue in time order. At a
            // tie the restart goes first so same-instant deliveries reach
            // the fresh process.
            let restart_first = match (next_restart, next_event) {
                (Some((restart_at, _)), Some(event_at)) => restart_at <= event_at,
                (Some(_), None) => true,
                (None, _) => false,
            };

            if restart_first {
                let Some((restart_at, index)) = next_restart else {
                    break;
                };
                if restart_at > end_time {
                    break;
                }
                self.pending_restarts.remove(&(restart_at, index));
                self.now = restart_at;
                self.restart_unit(index);
                continue;
            }

            let Some((&key, _)) = self.event_queue.first_key_value() else {
                break;
            };
            if key.time > end_time {
                debug!(
                    remaining_events = self.event_queue.len(),
                    "Time limit reached"
                );
                break;
            }

            let Some((key, event)) = self.event_queue.pop_first() else {
                break;
            };
            self.now = key.time;
            let index = key.node_index;

            if self.units[index as usize].halted {
                self.stats.events_dropped_halted += 1;
                trace!(unit = index, "Dropped event for halted unit");
                continue;
            }

            trace!(time = ?self.now, unit = index, "Processing event");

            self.stats.events_processed += 1;
            self.stats.events_by_priority[key.priority as usize] += 1;

            let unit = &mut self.units[index as usize];
            unit.machine.set_time(self.now);
            let actions = unit.machine.handle(event);

            self.stats.actions_generated += actions.len() as u64;

            for action in actions {
                self.process_action(index, action);
            }
        }

        trace!(
            events_processed = self.stats.events_processed,
            actions_generated = self.stats.actions_generated,
            final_time = ?self.now,
            "Simulation step complete"
        );
    }

    /// Execute one action emitted by a unit.
    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                // The publisher's own subscription does not cross the
                // network: self-delivery is immediate and lossless.
                let own = self.message_to_event(message.clone());
                self.schedule_event(from, self.now, own);
                for to in 0..self.units.len() as NodeIndex {
                    if to == from {
                        continue;
                    }
                    let event = self.message_to_event(message.clone());
                    self.try_deliver_message(from, to, event);
                }
            }

            Action::Send { to, message } => {
                let event = self.message_to_event(message);
                match self.unit_index(to) {
                    Some(target) if target == from => {
                        // Loopback skips the network.
                        self.schedule_event(from, self.now, event);
                    }
                    Some(target) => self.try_deliver_message(from, target, event),
                    None => {
                        warn!(%to, "Send to unknown unit dropped");
                    }
                }
            }

            Action::Request {
                to,
                request,
                request_id,
                timeout,
            } => {
                self.route_request(from, to, request, request_id, timeout);
            }

            Action::Reply {
                request_id,
                outcome,
            } => {
                self.deliver_reply(from, request_id, outcome);
            }

            Action::SetTimer { id, duration } => {
                let event = timer_event(id);
                let key = self.schedule_event(from, self.now + duration, event);
                // Re-arming an already pending timer replaces it.
                if let Some(old) = self.timers.insert((from, id), key) {
                    self.event_queue.remove(&old);
                }
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                // Internal priority sorts ahead of network traffic at the
                // same instant.
                self.schedule_event(from, self.now, event);
            }

            Action::ExecuteDeviceCommand {
                request_id,
                command,
            } => {
                // The device call runs inline; hardware latency is not
                // modelled.
                let result = self.units[from as usize].device.execute(&command);
                self.stats.device_commands += 1;
                self.schedule_event(
                    from,
                    self.now,
                    Event::DeviceCommandCompleted { request_id, result },
                );
            }

            Action::Halt { restart, reasons } => {
                self.halt_unit(from, restart, reasons);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Request Routing
    // ═══════════════════════════════════════════════════════════════════════

    /// Route a request to its destination and start the reply protocol.
    ///
    /// The requester's timeout is queued up front at `now + timeout`; only
    /// a reply that arrives strictly earlier removes it.
    fn route_request(
        &mut self,
        from: NodeIndex,
        to: Destination,
        request: OutboundRequest,
        request_id: RequestId,
        timeout: Duration,
    ) {
        let target = match to {
            Destination::DealService => {
                self.route_deal_service_request(from, request, request_id, timeout);
                return;
            }
            Destination::Unit(unit_id) => match self.unit_index(unit_id) {
                Some(index) => index,
                None => {
                    self.fail_request(
                        from,
                        request_id,
                        RequestError::unreachable(format!("unknown unit {unit_id}")),
                    );
                    return;
                }
            },
            Destination::Coordinator => match self.live_coordinator_index() {
                Some(index) => index,
                None => {
                    self.fail_request(
                        from,
                        request_id,
                        RequestError::unreachable("no coordinator is live"),
                    );
                    return;
                }
            },
        };

        if matches!(
            request,
            OutboundRequest::StopDeal(_) | OutboundRequest::DisposeDeal(_)
        ) {
            self.fail_request(
                from,
                request_id,
                RequestError::rejected(format!(
                    "{} is only served by the trading layer",
                    request.type_name()
                )),
            );
            return;
        }

        self.route_unit_request(from, target, request, request_id, timeout);
    }

    /// Deliver a request to a serving unit.
    fn route_unit_request(
        &mut self,
        from: NodeIndex,
        target: NodeIndex,
        request: OutboundRequest,
        request_id: RequestId,
        timeout: Duration,
    ) {
        let deadline = self.now + timeout;
        let timeout_key = self.schedule_event(
            from,
            deadline,
            Event::ReplyReceived {
                request_id,
                outcome: Err(RequestError::timeout()),
            },
        );

        // Self-requests skip the network; everything else runs the
        // partition, loss and latency gauntlet.
        let delivery = if target == from {
            Some(Duration::ZERO)
        } else {
            self.should_deliver_with_stats(from, target)
        };
        let Some(latency) = delivery else {
            // Request leg lost; the timeout stands.
            return;
        };

        let inbound_id = self.units[target as usize].inbound.next();
        let Some(event) = self.request_to_event(inbound_id, request) else {
            // Interchange requests were rejected in route_request; leaving
            // the timeout in place covers anything else without a serving
            // event.
            return;
        };

        self.pending.insert(
            (target, inbound_id),
            PendingRequest {
                requester: from,
                request_id,
                deadline,
                timeout_key,
            },
        );
        self.schedule_event(target, self.now + latency, event);
        self.stats.requests_routed += 1;
    }

    /// Serve a request addressed to the trading layer.
    ///
    /// The service call itself runs inline; both network legs still pay
    /// partition, loss and latency. A deal notification triggered by the
    /// call is published from the service at its serving time.
    fn route_deal_service_request(
        &mut self,
        from: NodeIndex,
        request: OutboundRequest,
        request_id: RequestId,
        timeout: Duration,
    ) {
        let deadline = self.now + timeout;
        let service = self.deal_service_index();
        let timeout_key = self.schedule_event(
            from,
            deadline,
            Event::ReplyReceived {
                request_id,
                outcome: Err(RequestError::timeout()),
            },
        );

        let Some(to_service) = self.should_deliver_with_stats(from, service) else {
            return;
        };
        let served_at = self.now + to_service;

        let (outcome, notification) = match request {
            OutboundRequest::StopDeal(stop) => {
                let (outcome, updated) = self.deal_service.on_stop(stop.deal_id, &stop.reasons);
                (outcome, updated.map(OutboundMessage::from))
            }
            OutboundRequest::DisposeDeal(dispose) => {
                let (outcome, removed) = self.deal_service.on_dispose(dispose.deal_id);
                (outcome, removed.map(OutboundMessage::from))
            }
            other => (
                Err(RequestError::rejected(format!(
                    "{} is not served by the trading layer",
                    other.type_name()
                ))),
                None,
            ),
        };
        self.stats.requests_routed += 1;

        if let Some(message) = notification {
            self.broadcast_from_service_at(served_at, message);
        }

        let Some(back) = self.should_deliver_with_stats(service, from) else {
            self.stats.replies_abandoned += 1;
            return;
        };
        let arrival = served_at + back;
        if arrival >= deadline {
            self.stats.replies_abandoned += 1;
            return;
        }

        self.event_queue.remove(&timeout_key);
        self.schedule_event(
            from,
            arrival,
            Event::ReplyReceived {
                request_id,
                outcome,
            },
        );
        self.stats.replies_delivered += 1;
    }

    /// Deliver a reply for a request this runner routed earlier.
    ///
    /// Replies race the requester's timeout: one that would land at or
    /// after the deadline is abandoned because the requester has already
    /// failed the request.
    fn deliver_reply(
        &mut self,
        responder: NodeIndex,
        request_id: RequestId,
        outcome: RequestOutcome,
    ) {
        let Some(entry) = self.pending.remove(&(responder, request_id)) else {
            trace!(
                responder,
                %request_id,
                "Reply without a pending request dropped"
            );
            return;
        };

        let delivery = if entry.requester == responder {
            Some(Duration::ZERO)
        } else {
            self.should_deliver_with_stats(responder, entry.requester)
        };
        let arrival = match delivery {
            Some(latency) => self.now + latency,
            None => {
                self.stats.replies_abandoned += 1;
                return;
            }
        };
        if arrival >= entry.deadline {
            self.stats.replies_abandoned += 1;
            trace!(
                responder,
                requester = entry.requester,
                "Reply lost the race against the timeout"
            );
            return;
        }

        self.event_queue.remove(&entry.timeout_key);
        self.schedule_event(
            entry.requester,
            arrival,
            Event::ReplyReceived {
                request_id: entry.request_id,
                outcome,
            },
        );
        self.stats.replies_delivered += 1;
    }

    /// Fail a request immediately, the way a bus with no consumer on the
    /// address does.
    fn fail_request(&mut self, from: NodeIndex, request_id: RequestId, error: RequestError) {
        self.stats.requests_unroutable += 1;
        self.schedule_event(
            from,
            self.now,
            Event::ReplyReceived {
                request_id,
                outcome: Err(error),
            },
        );
    }

    /// Index of the first live unit currently holding the coordinator role.
    fn live_coordinator_index(&self) -> Option<NodeIndex> {
        self.units
            .iter()
            .position(|unit| !unit.halted && unit.machine.is_coordinator())
            .map(|index| index as NodeIndex)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Halt and Restart
    // ═══════════════════════════════════════════════════════════════════════

    /// Halt a unit process. Its device keeps its last state; the process
    /// state is gone.
    fn halt_unit(&mut self, index: NodeIndex, restart: bool, reasons: Vec<String>) {
        let unit = &mut self.units[index as usize];
        if unit.halted {
            return;
        }
        unit.halted = true;
        self.stats.halts += 1;
        info!(unit = %unit.unit_id, restart, ?reasons, "Unit halted");

        // Everything addressed to the dead process disappears with it:
        // queued deliveries, its timers, its own request timeouts, and the
        // requests it was serving. Timeouts owned by other requesters stay
        // queued so they still see the failure.
        self.event_queue.retain(|key, _| key.node_index != index);
        self.timers.retain(|&(node, _), _| node != index);
        self.pending
            .retain(|&(responder, _), entry| responder != index && entry.requester != index);

        if restart {
            self.pending_restarts
                .insert((self.now + self.restart_delay, index));
        }
    }

    /// Bring a halted unit back as a fresh process.
    ///
    /// The device is hardware and keeps its state across the restart. The
    /// ledger is re-seeded from the trading layer the way a starting unit
    /// replays registrations, and the configured role is restored.
    fn restart_unit(&mut self, index: NodeIndex) {
        self.stats.restarts += 1;

        let (unit_id, configured_coordinator) = {
            let unit = &self.units[index as usize];
            (unit.unit_id, unit.configured_coordinator)
        };
        info!(unit = %unit_id, at = ?self.now, "Unit restarting");

        let mut machine = UnitStateMachine::new(unit_id, &self.policy, configured_coordinator);
        machine.set_time(self.now);
        {
            let unit = &mut self.units[index as usize];
            unit.machine = machine;
            unit.inbound = RequestIdAllocator::scoped(INBOUND_SCOPE);
            unit.halted = false;
        }

        // The device mirror starts from what the hardware actually reports.
        let status = self.units[index as usize].device.status();
        self.schedule_event(index, self.now, Event::LocalDeviceUpdated { status });

        // Replay this unit's registered deals from the trading layer.
        let service = self.deal_service_index();
        for deal in self.deal_service.deals_involving(unit_id) {
            if let Some(latency) = self.should_deliver_with_stats(service, index) {
                self.schedule_event(index, self.now + latency, Event::DealRegistered { deal });
                self.stats.messages_sent += 1;
            }
        }

        let actions = self.units[index as usize].machine.initialize();
        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            self.process_action(index, action);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery
    // ═══════════════════════════════════════════════════════════════════════

    /// Schedule an event.
    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    /// Try to deliver a message, accounting for partitions and packet loss.
    /// Updates stats based on delivery outcome.
    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, event: Event) {
        if let Some(latency) = self.should_deliver_with_stats(from, to) {
            self.schedule_event(to, self.now + latency, event);
            self.stats.messages_sent += 1;
        }
    }

    /// Partition and loss checks with stats, returning the sampled latency
    /// when the packet goes through.
    fn should_deliver_with_stats(&mut self, from: NodeIndex, to: NodeIndex) -> Option<Duration> {
        // Check partition first (deterministic, doesn't consume RNG).
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            trace!(from, to, "Message dropped due to partition");
            return None;
        }
        // Packet loss is probabilistic but deterministic with the seeded
        // RNG.
        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            trace!(from, to, "Message dropped due to packet loss");
            return None;
        }
        Some(self.network.sample_latency(&mut self.rng))
    }

    /// Publish a trading-layer notification to every unit.
    fn broadcast_from_service_at(&mut self, at: Duration, message: OutboundMessage) {
        let service = self.deal_service_index();
        for to in 0..self.units.len() as NodeIndex {
            if let Some(latency) = self.should_deliver_with_stats(service, to) {
                let event = self.message_to_event(message.clone());
                self.schedule_event(to, at + latency, event);
                self.stats.messages_sent += 1;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Wire Conversions
    // ═══════════════════════════════════════════════════════════════════════

    /// Convert an outbound message to the event its subscribers receive.
    fn message_to_event(&self, message: OutboundMessage) -> Event {
        match message {
            OutboundMessage::Heartbeat(heartbeat) => Event::HeartbeatReceived {
                coordinator: heartbeat.coordinator,
            },
            OutboundMessage::TelemetryRequest(request) => Event::TelemetryRequested {
                round: request.round,
                requester: request.requester,
            },
            OutboundMessage::TelemetryReply(reply) => Event::TelemetryReplyReceived {
                round: reply.round,
                telemetry: reply.telemetry,
            },
            OutboundMessage::FaultReport(report) => Event::FaultReported {
                fault: report.fault,
            },
            OutboundMessage::Scram(scram) => Event::ScramReceived {
                exclude_voltage_reference: scram.exclude_voltage_reference,
                reasons: scram.reasons,
            },
            OutboundMessage::GlobalMode(change) => Event::GlobalModeReceived {
                mode: change.mode,
                reasons: change.reasons,
            },
            OutboundMessage::ShutdownAll(order) => Event::ShutdownAllReceived {
                reasons: order.reasons,
            },
            OutboundMessage::ResetAll(order) => Event::ResetAllReceived {
                reasons: order.reasons,
            },
            OutboundMessage::DealRegistered(notice) => Event::DealRegistered { deal: notice.deal },
            OutboundMessage::DealUpdated(notice) => Event::DealUpdated { deal: notice.deal },
            OutboundMessage::DealRemoved(notice) => Event::DealRemoved {
                deal_id: notice.deal_id,
            },
        }
    }

    /// Convert an outbound request to the event the serving unit receives,
    /// carrying the inbound id its reply must echo.
    ///
    /// Interchange requests return `None`: only the trading layer serves
    /// those.
    fn request_to_event(&self, request_id: RequestId, request: OutboundRequest) -> Option<Event> {
        Some(match request {
            OutboundRequest::DeviceExecute(execute) => Event::DeviceCommandRequested {
                request_id,
                command: execute.command,
            },
            OutboundRequest::CachedTelemetry(cached) => Event::CachedTelemetryRequested {
                request_id,
                not_older_than: cached.bound(),
            },
            OutboundRequest::FaultQuery(_) => Event::FaultQueryRequested { request_id },
            OutboundRequest::Demote(demote) => Event::DemoteRequested {
                request_id,
                reasons: demote.reasons,
            },
            OutboundRequest::Shutdown(shutdown) => Event::ShutdownRequested {
                request_id,
                reasons: shutdown.reasons,
            },
            OutboundRequest::Reset(reset) => Event::ResetRequested {
                request_id,
                reasons: reset.reasons,
            },
            OutboundRequest::StopDeal(_) | OutboundRequest::DisposeDeal(_) => return None,
        })
    }
}
