//! Unit state machine.

use gridmesh_aggregation::AggregationState;
use gridmesh_core::{
    Action, Event, RequestId, StateMachine, SubStateMachine, INBOUND_SCOPE,
};
use gridmesh_handover::HandoverState;
use gridmesh_helo::HeloState;
use gridmesh_messages::{ReplyPayload, RequestError, TelemetryReply};
use gridmesh_recovery::RecoveryState;
use gridmesh_safety::SafetyState;
use gridmesh_types::{
    DealLedger, DeviceCommand, DeviceMode, DeviceStatus, OperationMode, Policy, UnitId,
    UnitTelemetry,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Combined unit state machine.
///
/// Composes the uniqueness guard, aggregation, safety evaluation, handover,
/// and the escalation dispatcher into a single state machine. The
/// coordinator role is fixed at process start and can only be given up;
/// a demoted unit keeps running as an ordinary member.
///
/// The root owns the unit-wide mirrors every component reads through it:
/// the last local device status, this unit's trading mode, and (inside the
/// dispatcher) the interchange ledger.
#[derive(Debug)]
pub struct UnitStateMachine {
    /// This unit's identity.
    unit_id: UnitId,

    /// Coordinator uniqueness guard.
    helo: HeloState,

    /// Telemetry aggregation rounds (coordinator side).
    aggregation: AggregationState,

    /// Cluster safety evaluation over completed snapshots.
    safety: SafetyState,

    /// Voltage-reference handover driver.
    handover: HandoverState,

    /// Fault collection and escalating recovery.
    recovery: RecoveryState,

    /// Last status heard from the local device adapter.
    device: DeviceStatus,

    /// This unit's effective trading mode, reported in telemetry.
    operation_mode: OperationMode,

    /// Current time.
    now: Duration,
}

impl UnitStateMachine {
    pub fn new(unit_id: UnitId, policy: &Policy, is_coordinator: bool) -> Self {
        Self {
            unit_id,
            helo: HeloState::new(unit_id, policy, is_coordinator),
            aggregation: AggregationState::new(unit_id, policy, is_coordinator),
            safety: SafetyState::new(unit_id, policy, is_coordinator),
            handover: HandoverState::new(unit_id, policy, is_coordinator),
            recovery: RecoveryState::new(unit_id, policy, is_coordinator),
            device: DeviceStatus::default(),
            operation_mode: OperationMode::Run,
            now: Duration::ZERO,
        }
    }

    /// Get this unit's identity.
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Whether this unit currently holds the coordinator role.
    pub fn is_coordinator(&self) -> bool {
        self.helo.is_coordinator()
    }

    /// This unit's effective trading mode.
    pub fn operation_mode(&self) -> OperationMode {
        self.operation_mode
    }

    /// Last status heard from the local device adapter.
    pub fn device_status(&self) -> DeviceStatus {
        self.device
    }

    /// The interchange read-model.
    pub fn ledger(&self) -> &DealLedger {
        self.recovery.ledger()
    }

    /// Get a reference to the uniqueness guard.
    pub fn helo(&self) -> &HeloState {
        &self.helo
    }

    /// Get a reference to the aggregation state.
    pub fn aggregation(&self) -> &AggregationState {
        &self.aggregation
    }

    /// Get a reference to the safety evaluator.
    pub fn safety(&self) -> &SafetyState {
        &self.safety
    }

    /// Get a reference to the handover driver.
    pub fn handover(&self) -> &HandoverState {
        &self.handover
    }

    /// Get a reference to the escalation dispatcher.
    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    /// Startup actions: role claims and the periodic cadences.
    pub fn initialize(&mut self) -> Vec<Action> {
        info!(
            unit = %self.unit_id,
            coordinator = self.helo.is_coordinator(),
            "initializing unit state machine"
        );
        let mut actions = self.helo.initialize();
        actions.extend(self.aggregation.initialize());
        actions.extend(self.recovery.initialize());
        actions
    }

    /// Answer a telemetry round with this unit's current record.
    ///
    /// A unit that has entered stopping mode stays silent: the coordinator
    /// tolerates the missing reply instead of reading a shutdown race as
    /// missing data.
    fn on_telemetry_requested(&mut self, round: u64, requester: UnitId) -> Vec<Action> {
        if self.operation_mode == OperationMode::Stopping {
            debug!(round, "suppressing telemetry answer while stopping");
            return vec![];
        }

        let telemetry = UnitTelemetry {
            unit_id: self.unit_id,
            device: self.device,
            operation_mode: self.operation_mode,
            interlock_count: self.recovery.ledger().interlock_count(self.unit_id),
        };
        vec![Action::Send {
            to: requester,
            message: TelemetryReply::new(round, telemetry).into(),
        }]
    }

    /// Give up the coordinator role across every component.
    ///
    /// Queued global faults become the next coordinator's problem; a
    /// handover in flight is abandoned; the aggregation cadence stops.
    fn on_demote_requested(&mut self, request_id: RequestId, reasons: &[String]) -> Vec<Action> {
        if !self.helo.is_coordinator() {
            debug!("demotion requested but this unit is not the coordinator");
            return vec![Action::Reply {
                request_id,
                outcome: Err(RequestError::rejected("not the coordinator")),
            }];
        }

        info!(?reasons, "demoting from coordinator role");
        let mut actions = self.helo.demote(reasons);
        actions.extend(self.aggregation.demote());
        self.safety.demote();
        self.handover.demote();
        self.recovery.demote();
        actions.push(Action::Reply {
            request_id,
            outcome: Ok(ReplyPayload::Ack),
        });
        actions
    }

    /// Start a voltage-reference handover.
    ///
    /// The outgoing unit's next mode comes from its interchange position:
    /// a unit discharging or charging in a deal returns to that passive
    /// mode, a unit with no deal returns to wait.
    fn on_handover_requested(&mut self, from: UnitId, to: UnitId) -> Vec<Action> {
        let from_next_mode = self
            .recovery
            .ledger()
            .iter()
            .find_map(|deal| deal.side_of(from).map(|side| side.passive_mode()))
            .unwrap_or(DeviceMode::Wait);
        self.handover.start(from, to, from_next_mode)
    }

    /// Emergency stop order for the local device.
    fn on_scram(&mut self, exclude_voltage_reference: bool, reasons: &[String]) -> Vec<Action> {
        if exclude_voltage_reference && self.device.mode == DeviceMode::VoltageReference {
            info!(
                ?reasons,
                "scram received, holding the voltage reference until the grid settles"
            );
            return vec![];
        }
        warn!(?reasons, "scram received, stopping local device");
        vec![Action::ExecuteDeviceCommand {
            request_id: None,
            command: DeviceCommand::Stop,
        }]
    }

    fn on_global_mode(&mut self, mode: OperationMode, reasons: &[String]) -> Vec<Action> {
        info!(%mode, ?reasons, "cluster trading mode changed");
        self.operation_mode = mode;
        self.aggregation.set_stopping(mode != OperationMode::Run);
        vec![]
    }

    fn on_stopping_entered(&mut self, reasons: &[String]) -> Vec<Action> {
        info!(?reasons, "unit entering stopping mode");
        self.operation_mode = OperationMode::Stopping;
        self.aggregation.set_stopping(true);
        vec![]
    }

    /// Answer the caller of a device command with the completion result.
    fn on_inbound_device_result(
        &mut self,
        request_id: RequestId,
        result: &Result<DeviceStatus, String>,
    ) -> Vec<Action> {
        let outcome = match result {
            Ok(status) => Ok(ReplyPayload::DeviceStatus(*status)),
            Err(message) => Err(RequestError::rejected(message.clone())),
        };
        vec![Action::Reply {
            request_id,
            outcome,
        }]
    }

    fn dispatch(&mut self, event: &Event) -> Vec<Action> {
        match event {
            // ═══════════════════════════════════════════════════════════════
            // Events the composition root owns: they need the unit-wide
            // mirrors or fan out across components.
            // ═══════════════════════════════════════════════════════════════
            Event::TelemetryRequested { round, requester } => {
                return self.on_telemetry_requested(*round, *requester);
            }

            Event::DemoteRequested {
                request_id,
                reasons,
            } => {
                return self.on_demote_requested(*request_id, reasons);
            }

            Event::HandoverRequested { from, to } => {
                return self.on_handover_requested(*from, *to);
            }

            Event::ScramReceived {
                exclude_voltage_reference,
                reasons,
            } => {
                return self.on_scram(*exclude_voltage_reference, reasons);
            }

            Event::GlobalModeReceived { mode, reasons } => {
                return self.on_global_mode(*mode, reasons);
            }

            Event::StoppingEntered { reasons } => {
                return self.on_stopping_entered(reasons);
            }

            // The safety checks read the interchange ledger alongside the
            // snapshot, so the root hands both over.
            Event::SnapshotReady { snapshot } => {
                return self.safety.on_snapshot(snapshot, self.recovery.ledger());
            }

            Event::ShutdownAllReceived { reasons } => {
                warn!(?reasons, "cluster-wide shutdown ordered");
                return vec![Action::Halt {
                    restart: false,
                    reasons: reasons.clone(),
                }];
            }

            Event::ResetAllReceived { reasons } => {
                warn!(?reasons, "cluster-wide reset ordered");
                return vec![Action::Halt {
                    restart: true,
                    reasons: reasons.clone(),
                }];
            }

            Event::ShutdownRequested {
                request_id,
                reasons,
            } => {
                warn!(?reasons, "shutdown requested");
                return vec![
                    Action::Reply {
                        request_id: *request_id,
                        outcome: Ok(ReplyPayload::Ack),
                    },
                    Action::Halt {
                        restart: false,
                        reasons: reasons.clone(),
                    },
                ];
            }

            Event::ResetRequested {
                request_id,
                reasons,
            } => {
                warn!(?reasons, "reset requested");
                return vec![
                    Action::Reply {
                        request_id: *request_id,
                        outcome: Ok(ReplyPayload::Ack),
                    },
                    Action::Halt {
                        restart: true,
                        reasons: reasons.clone(),
                    },
                ];
            }

            Event::DeviceCommandRequested {
                request_id,
                command,
            } => {
                debug!(%request_id, ?command, "executing device command for remote caller");
                return vec![Action::ExecuteDeviceCommand {
                    request_id: Some(*request_id),
                    command: command.clone(),
                }];
            }

            Event::LocalDeviceUpdated { status } => {
                self.device = *status;
                return vec![];
            }

            // Completions keep the device mirror fresh no matter which
            // component ran the command; answering or routing comes after.
            Event::DeviceCommandCompleted { request_id, result } => {
                if let Ok(status) = result {
                    self.device = *status;
                }
                match request_id {
                    Some(id) if id.scope() == INBOUND_SCOPE => {
                        return self.on_inbound_device_result(*id, result);
                    }
                    None => {
                        match result {
                            Ok(status) => debug!(mode = %status.mode, "device command completed"),
                            Err(err) => warn!(%err, "fire-and-forget device command failed"),
                        }
                        return vec![];
                    }
                    // A component's own command: fall through to the chain.
                    Some(_) => {}
                }
            }

            _ => {}
        }

        // ═══════════════════════════════════════════════════════════════════
        // Everything else belongs to exactly one component.
        // ═══════════════════════════════════════════════════════════════════
        if let Some(actions) = self.helo.try_handle(event) {
            return actions;
        }
        if let Some(actions) = self.aggregation.try_handle(event) {
            return actions;
        }
        if let Some(actions) = self.handover.try_handle(event) {
            return actions;
        }
        if let Some(actions) = self.recovery.try_handle(event) {
            return actions;
        }

        match event {
            // Replies can outlive the step that sent them; an aborted
            // handover or a finished recovery step makes this ordinary.
            Event::ReplyReceived { request_id, .. } => {
                debug!(%request_id, "reply for a request no component is waiting on");
            }
            Event::DeviceCommandCompleted { request_id, .. } => {
                debug!(?request_id, "device result for a finished step");
            }
            _ => warn!(event = event.type_name(), "event not claimed by any component"),
        }
        vec![]
    }
}

impl StateMachine for UnitStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        let actions = self.dispatch(&event);
        // A transfer starting or ending changes what the safety evaluator
        // may conclude from mixed device modes.
        self.safety
            .set_suppressed(self.handover.suppression_active());
        actions
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.helo.set_time(now);
        self.aggregation.set_time(now);
        self.safety.set_time(now);
        self.handover.set_time(now);
        self.recovery.set_time(now);
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmesh_core::{
        Destination, OutboundMessage, OutboundRequest, RequestIdAllocator, TimerId,
    };
    use gridmesh_messages::DeviceExecuteRequest;
    use gridmesh_types::test_utils::{test_deal, test_fault, test_policy, test_snapshot};
    use gridmesh_types::{DealId, FaultCategory, FaultScope, FaultSeverity, SideActivity};

    fn unit(id: u64, coordinator: bool) -> UnitStateMachine {
        UnitStateMachine::new(UnitId(id), &test_policy(&[1, 2, 3]), coordinator)
    }

    fn inbound_id() -> RequestId {
        RequestIdAllocator::scoped(INBOUND_SCOPE).next()
    }

    fn sent_telemetry(actions: &[Action]) -> Option<(UnitId, &TelemetryReply)> {
        actions.iter().find_map(|action| match action {
            Action::Send {
                to,
                message: OutboundMessage::TelemetryReply(reply),
            } => Some((*to, reply)),
            _ => None,
        })
    }

    fn device_request(actions: &[Action]) -> Option<(&Destination, &DeviceExecuteRequest)> {
        actions.iter().find_map(|action| match action {
            Action::Request {
                to,
                request: OutboundRequest::DeviceExecute(req),
                ..
            } => Some((to, req)),
            _ => None,
        })
    }

    fn reply_outcome(actions: &[Action]) -> Option<&gridmesh_messages::RequestOutcome> {
        actions.iter().find_map(|action| match action {
            Action::Reply { outcome, .. } => Some(outcome),
            _ => None,
        })
    }

    fn device_reply(machine: &mut UnitStateMachine, actions: &[Action], mode: DeviceMode) -> Vec<Action> {
        let request_id = actions
            .iter()
            .find_map(|action| match action {
                Action::Request {
                    request: OutboundRequest::DeviceExecute(_),
                    request_id,
                    ..
                } => Some(*request_id),
                _ => None,
            })
            .expect("expected an outstanding device request");
        machine.handle(Event::ReplyReceived {
            request_id,
            outcome: Ok(ReplyPayload::DeviceStatus(DeviceStatus {
                mode,
                grid_voltage: 380.0,
                grid_current: 0.0,
            })),
        })
    }

    #[test]
    fn test_coordinator_startup_arms_all_cadences() {
        let mut machine = unit(1, true);
        let actions = machine.initialize();

        let timers: Vec<TimerId> = actions
            .iter()
            .filter_map(|a| match a {
                Action::SetTimer { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert!(timers.contains(&TimerId::Heartbeat));
        assert!(timers.contains(&TimerId::Collection));
        assert!(timers.contains(&TimerId::Sweep));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast {
                message: OutboundMessage::Heartbeat(_)
            }
        )));
    }

    #[test]
    fn test_member_startup_queries_and_sweeps_only() {
        let mut machine = unit(2, false);
        let actions = machine.initialize();

        let timers: Vec<TimerId> = actions
            .iter()
            .filter_map(|a| match a {
                Action::SetTimer { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(timers, vec![TimerId::Sweep]);
    }

    #[test]
    fn test_telemetry_answer_reflects_mirrors() {
        let mut machine = unit(2, false);
        machine.handle(Event::LocalDeviceUpdated {
            status: DeviceStatus {
                mode: DeviceMode::Discharge,
                grid_voltage: 381.5,
                grid_current: 12.0,
            },
        });
        machine.handle(Event::DealRegistered {
            deal: test_deal(7, 2, 3),
        });

        let actions = machine.handle(Event::TelemetryRequested {
            round: 4,
            requester: UnitId(1),
        });
        let (to, reply) = sent_telemetry(&actions).expect("telemetry answer");
        assert_eq!(to, UnitId(1));
        assert_eq!(reply.round, 4);
        assert_eq!(reply.telemetry.unit_id, UnitId(2));
        assert_eq!(reply.telemetry.device.mode, DeviceMode::Discharge);
        assert_eq!(reply.telemetry.operation_mode, OperationMode::Run);
        assert_eq!(reply.telemetry.interlock_count, 1);
    }

    #[test]
    fn test_stopping_unit_stays_silent_in_rounds() {
        let mut machine = unit(2, false);
        machine.handle(Event::StoppingEntered {
            reasons: vec!["hardware fault".into()],
        });

        let actions = machine.handle(Event::TelemetryRequested {
            round: 1,
            requester: UnitId(1),
        });
        assert!(actions.is_empty());
        assert_eq!(machine.operation_mode(), OperationMode::Stopping);
    }

    #[test]
    fn test_global_mode_mirrors_into_telemetry() {
        let mut machine = unit(2, false);
        machine.handle(Event::GlobalModeReceived {
            mode: OperationMode::Stop,
            reasons: vec!["grid fault".into()],
        });

        let actions = machine.handle(Event::TelemetryRequested {
            round: 1,
            requester: UnitId(1),
        });
        let (_, reply) = sent_telemetry(&actions).expect("stop mode still answers");
        assert_eq!(reply.telemetry.operation_mode, OperationMode::Stop);
    }

    #[test]
    fn test_demotion_fans_out_and_acks() {
        let mut machine = unit(1, true);
        machine.initialize();

        let actions = machine.handle(Event::DemoteRequested {
            request_id: inbound_id(),
            reasons: vec!["operator request".into()],
        });

        assert_eq!(reply_outcome(&actions), Some(&Ok(ReplyPayload::Ack)));
        let cancelled: Vec<TimerId> = actions
            .iter()
            .filter_map(|a| match a {
                Action::CancelTimer { id } => Some(*id),
                _ => None,
            })
            .collect();
        assert!(cancelled.contains(&TimerId::Heartbeat));
        assert!(cancelled.contains(&TimerId::Collection));
        assert!(!machine.is_coordinator());

        // The stale heartbeat timer does nothing after demotion.
        assert!(machine.handle(Event::HeartbeatTimer).is_empty());
    }

    #[test]
    fn test_demotion_refused_when_not_coordinator() {
        let mut machine = unit(2, false);
        let actions = machine.handle(Event::DemoteRequested {
            request_id: inbound_id(),
            reasons: vec![],
        });
        assert!(matches!(
            reply_outcome(&actions),
            Some(Err(err)) if err.is_rejected()
        ));
    }

    #[test]
    fn test_demotion_discards_queued_global_faults() {
        let mut machine = unit(1, true);
        machine.initialize();
        machine.handle(Event::FaultReported {
            fault: test_fault(
                FaultCategory::Hardware,
                FaultScope::Global,
                FaultSeverity::Error,
                3,
            ),
        });
        machine.handle(Event::DemoteRequested {
            request_id: inbound_id(),
            reasons: vec!["new coordinator elected".into()],
        });

        let actions = machine.handle(Event::SweepTimer);
        assert!(
            !actions
                .iter()
                .any(|a| matches!(a, Action::Broadcast { message: OutboundMessage::Scram(_) })),
            "global faults left with the role"
        );
    }

    #[test]
    fn test_handover_targets_outgoing_unit_first() {
        let mut machine = unit(1, true);
        let actions = machine.handle(Event::HandoverRequested {
            from: UnitId(2),
            to: UnitId(3),
        });

        let (to, req) = device_request(&actions).expect("first phase request");
        assert_eq!(*to, Destination::Unit(UnitId(2)));
        assert!(matches!(
            req.command(),
            DeviceCommand::SetMode {
                mode: DeviceMode::VoltageReference,
                droop_ratio: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_handover_returns_outgoing_unit_to_its_deal_side() {
        let mut machine = unit(1, true);
        machine.handle(Event::DealRegistered {
            deal: test_deal(9, 2, 3),
        });

        let actions = machine.handle(Event::HandoverRequested {
            from: UnitId(2),
            to: UnitId(3),
        });
        let actions = device_reply(&mut machine, &actions, DeviceMode::VoltageReference);
        let actions = device_reply(&mut machine, &actions, DeviceMode::VoltageReference);

        // Third phase: the outgoing unit leaves the reference role for the
        // passive side of its interchange.
        let (to, req) = device_request(&actions).expect("release request");
        assert_eq!(*to, Destination::Unit(UnitId(2)));
        assert!(matches!(
            req.command(),
            DeviceCommand::SetMode {
                mode: DeviceMode::Discharge,
                grid_voltage_setpoint: None,
                droop_ratio: None,
            }
        ));
    }

    #[test]
    fn test_safety_suppressed_while_transfer_in_flight() {
        let mut machine = unit(1, true);
        machine.handle(Event::HandoverRequested {
            from: UnitId(2),
            to: UnitId(3),
        });
        assert!(machine.handover().suppression_active());
    }

    #[test]
    fn test_scram_stops_local_device() {
        let mut machine = unit(2, false);
        let actions = machine.handle(Event::ScramReceived {
            exclude_voltage_reference: false,
            reasons: vec!["global hardware fault".into()],
        });
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ExecuteDeviceCommand {
                request_id: None,
                command: DeviceCommand::Stop,
            }
        )));
    }

    #[test]
    fn test_scram_first_stage_spares_voltage_reference() {
        let mut machine = unit(2, false);
        machine.handle(Event::LocalDeviceUpdated {
            status: DeviceStatus {
                mode: DeviceMode::VoltageReference,
                grid_voltage: 380.0,
                grid_current: 0.0,
            },
        });

        let actions = machine.handle(Event::ScramReceived {
            exclude_voltage_reference: true,
            reasons: vec![],
        });
        assert!(actions.is_empty());

        // The second stage stops the reference as well.
        let actions = machine.handle(Event::ScramReceived {
            exclude_voltage_reference: false,
            reasons: vec![],
        });
        assert!(!actions.is_empty());
    }

    #[test]
    fn test_cluster_shutdown_and_reset_orders() {
        let mut machine = unit(2, false);
        let actions = machine.handle(Event::ShutdownAllReceived {
            reasons: vec!["fatal fault".into()],
        });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Halt { restart: false, .. })));

        let mut machine = unit(3, false);
        let actions = machine.handle(Event::ResetAllReceived {
            reasons: vec!["logic fault".into()],
        });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Halt { restart: true, .. })));
    }

    #[test]
    fn test_shutdown_request_acks_before_halting() {
        let mut machine = unit(2, false);
        let actions = machine.handle(Event::ShutdownRequested {
            request_id: inbound_id(),
            reasons: vec!["operator".into()],
        });
        assert_eq!(reply_outcome(&actions), Some(&Ok(ReplyPayload::Ack)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Halt { restart: false, .. })));
    }

    #[test]
    fn test_device_command_request_answered_on_completion() {
        let mut machine = unit(2, false);
        let request_id = inbound_id();

        let actions = machine.handle(Event::DeviceCommandRequested {
            request_id,
            command: DeviceCommand::GetStatus,
        });
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ExecuteDeviceCommand {
                request_id: Some(id),
                ..
            } if *id == request_id
        )));

        let status = DeviceStatus {
            mode: DeviceMode::Charge,
            grid_voltage: 379.0,
            grid_current: -8.0,
        };
        let actions = machine.handle(Event::DeviceCommandCompleted {
            request_id: Some(request_id),
            result: Ok(status),
        });
        match reply_outcome(&actions) {
            Some(Ok(ReplyPayload::DeviceStatus(reported))) => {
                assert_eq!(reported.mode, DeviceMode::Charge);
            }
            other => panic!("expected device status reply, got {other:?}"),
        }
        // The completion also refreshed the mirror.
        assert_eq!(machine.device_status().mode, DeviceMode::Charge);
    }

    #[test]
    fn test_failed_device_command_rejects_caller() {
        let mut machine = unit(2, false);
        let request_id = inbound_id();
        machine.handle(Event::DeviceCommandRequested {
            request_id,
            command: DeviceCommand::Stop,
        });

        let actions = machine.handle(Event::DeviceCommandCompleted {
            request_id: Some(request_id),
            result: Err("adapter lost the device link".into()),
        });
        assert!(matches!(
            reply_outcome(&actions),
            Some(Err(err)) if err.is_rejected()
        ));
    }

    #[test]
    fn test_fault_reports_reach_the_dispatcher() {
        let mut machine = unit(2, false);
        machine.handle(Event::FaultReported {
            fault: test_fault(
                FaultCategory::Hardware,
                FaultScope::Local,
                FaultSeverity::Error,
                2,
            ),
        });

        let actions = machine.handle(Event::SweepTimer);
        assert!(
            actions.iter().any(|a| matches!(
                a,
                Action::ExecuteDeviceCommand {
                    command: DeviceCommand::Stop,
                    ..
                }
            )),
            "the sweep escalates the retained fault"
        );
    }

    #[test]
    fn test_deal_updates_flow_into_ledger() {
        let mut machine = unit(2, false);
        machine.handle(Event::DealRegistered {
            deal: test_deal(5, 2, 3),
        });
        assert_eq!(machine.ledger().interlock_count(UnitId(2)), 1);

        let mut done = test_deal(5, 2, 3);
        done.discharge_activity = SideActivity::Deactivated;
        machine.handle(Event::DealUpdated { deal: done });
        assert_eq!(machine.ledger().interlock_count(UnitId(2)), 0);

        machine.handle(Event::DealRemoved {
            deal_id: DealId(5),
        });
        assert!(machine.ledger().is_empty());
    }

    #[test]
    fn test_snapshot_evaluation_sees_the_ledger() {
        let mut machine = unit(1, true);
        machine.handle(Event::DealRegistered {
            deal: test_deal(7, 2, 3),
        });

        // Units 2 and 3 are interchanging, so their 80 A exceeds the 60 A
        // budget their pair is allowed.
        let snapshot = test_snapshot(
            &[
                (1, DeviceMode::VoltageReference, 0.0),
                (2, DeviceMode::Discharge, 40.0),
                (3, DeviceMode::Discharge, 40.0),
            ],
            Duration::from_secs(5),
        );
        let actions = machine.handle(Event::SnapshotReady { snapshot });

        assert!(
            actions.iter().any(|a| matches!(
                a,
                Action::Broadcast {
                    message: OutboundMessage::FaultReport(report)
                } if report.fault().message.contains("grid current")
            )),
            "the budget check saw the registered interchange"
        );
    }

    #[test]
    fn test_unclaimed_late_reply_is_harmless() {
        let mut machine = unit(2, false);
        let actions = machine.handle(Event::ReplyReceived {
            request_id: RequestId(42),
            outcome: Ok(ReplyPayload::Ack),
        });
        assert!(actions.is_empty());
    }
}
