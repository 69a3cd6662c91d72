//! Reference transfer sub-state machine.

use gridmesh_core::{
    Action, Destination, Event, RequestId, RequestIdAllocator, SubStateMachine,
};
use gridmesh_messages::{DeviceExecuteRequest, FaultReportBroadcast, RequestOutcome};
use gridmesh_types::{
    DeviceCommand, DeviceMode, FaultCategory, FaultRecord, FaultScope, FaultSeverity, Policy,
    UnitId,
};
use std::time::Duration;
use tracing::{error, info, warn};

/// Request-id scope for reference transfers, so replies can be routed back
/// here without consulting the other sub-machines.
const HANDOVER_SCOPE: u8 = 1;

/// The four device commands of a reference transfer, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverPhase {
    /// Re-assert the outgoing reference with a droop slope.
    AssertOldDroop,
    /// Switch the incoming unit to voltage reference with the same slope.
    EngageNew,
    /// Release the outgoing unit into its follow-up mode.
    ReleaseOld,
    /// Zero the incoming reference's droop slope.
    StiffenNew,
}

impl HandoverPhase {
    fn name(&self) -> &'static str {
        match self {
            HandoverPhase::AssertOldDroop => "assert-old-droop",
            HandoverPhase::EngageNew => "engage-new",
            HandoverPhase::ReleaseOld => "release-old",
            HandoverPhase::StiffenNew => "stiffen-new",
        }
    }

    fn next(&self) -> Option<HandoverPhase> {
        match self {
            HandoverPhase::AssertOldDroop => Some(HandoverPhase::EngageNew),
            HandoverPhase::EngageNew => Some(HandoverPhase::ReleaseOld),
            HandoverPhase::ReleaseOld => Some(HandoverPhase::StiffenNew),
            HandoverPhase::StiffenNew => None,
        }
    }
}

/// One transfer in flight. Exists from the first command until the last
/// reply is verified or the transfer aborts.
#[derive(Debug)]
struct Transfer {
    from: UnitId,
    to: UnitId,
    /// Mode the outgoing unit falls back to when it releases the role.
    from_next_mode: DeviceMode,
    phase: HandoverPhase,
    pending: RequestId,
}

impl Transfer {
    /// Unit the current phase's command is addressed to.
    fn target(&self) -> UnitId {
        match self.phase {
            HandoverPhase::AssertOldDroop | HandoverPhase::ReleaseOld => self.from,
            HandoverPhase::EngageNew | HandoverPhase::StiffenNew => self.to,
        }
    }

    /// Mode the target device must report back for the phase to count.
    fn expected_mode(&self) -> DeviceMode {
        match self.phase {
            HandoverPhase::ReleaseOld => self.from_next_mode,
            _ => DeviceMode::VoltageReference,
        }
    }
}

/// Coordinator-side driver for moving the voltage reference role.
#[derive(Debug)]
pub struct HandoverState {
    unit_id: UnitId,
    is_coordinator: bool,

    /// Voltage setpoint re-issued to both participants.
    grid_voltage_setpoint: f64,
    /// Droop slope used while both references coexist.
    droop_ratio: f64,
    request_timeout: Duration,

    transfer: Option<Transfer>,
    alloc: RequestIdAllocator,

    /// Current time.
    now: Duration,

    stats: HandoverStats,
}

/// Statistics from the transfer driver for metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandoverStats {
    /// Transfers that ran all four phases.
    pub transfers_completed: u64,
    /// Transfers aborted on a failed or mismatching phase.
    pub transfers_aborted: u64,
    /// Start requests turned away (already busy, not coordinator).
    pub transfers_refused: u64,
}

impl HandoverState {
    pub fn new(unit_id: UnitId, policy: &Policy, is_coordinator: bool) -> Self {
        Self {
            unit_id,
            is_coordinator,
            grid_voltage_setpoint: policy.grid_voltage_setpoint,
            droop_ratio: policy.droop_ratio,
            request_timeout: policy.request_timeout,
            transfer: None,
            alloc: RequestIdAllocator::scoped(HANDOVER_SCOPE),
            now: Duration::ZERO,
            stats: HandoverStats::default(),
        }
    }

    /// Begin moving the reference role from `from` to `to`. `from_next_mode`
    /// is the passive mode the outgoing unit drops into in phase three,
    /// derived by the caller from the interchange the units participate in.
    pub fn start(&mut self, from: UnitId, to: UnitId, from_next_mode: DeviceMode) -> Vec<Action> {
        if !self.is_coordinator {
            warn!(%from, %to, "ignoring reference transfer request: not the coordinator");
            self.stats.transfers_refused += 1;
            return vec![];
        }
        if let Some(transfer) = &self.transfer {
            warn!(
                %from,
                %to,
                in_flight_from = %transfer.from,
                in_flight_to = %transfer.to,
                "ignoring reference transfer request: transfer already in flight"
            );
            self.stats.transfers_refused += 1;
            return vec![];
        }
        if from == to {
            warn!(%from, "ignoring reference transfer request: source and target are the same unit");
            self.stats.transfers_refused += 1;
            return vec![];
        }
        if self.droop_ratio <= 0.0 {
            // Without a droop slope the two references would fight instead
            // of sharing; refuse rather than command an unstable overlap.
            error!(droop_ratio = self.droop_ratio, "cannot start reference transfer");
            self.stats.transfers_refused += 1;
            return vec![self.raise(
                FaultCategory::User,
                self.unit_id,
                format!(
                    "configured droop ratio {} is not usable for a reference transfer",
                    self.droop_ratio
                ),
            )];
        }

        info!(%from, %to, next_mode = %from_next_mode, "starting reference transfer");
        let transfer = Transfer {
            from,
            to,
            from_next_mode,
            phase: HandoverPhase::AssertOldDroop,
            pending: self.alloc.next(),
        };
        let request = self.request_for(&transfer);
        self.transfer = Some(transfer);
        vec![request]
    }

    /// True while a transfer is in flight; the safety evaluator skips its
    /// device checks during this window.
    pub fn suppression_active(&self) -> bool {
        self.transfer.is_some()
    }

    /// Give up the coordinator role. An in-flight transfer is abandoned
    /// without raising a fault; the new coordinator's safety checks will
    /// report whatever reference state the cluster was left in.
    pub fn demote(&mut self) {
        self.is_coordinator = false;
        if let Some(transfer) = self.transfer.take() {
            warn!(
                from = %transfer.from,
                to = %transfer.to,
                phase = transfer.phase.name(),
                "abandoning reference transfer on demotion"
            );
        }
    }

    /// Get statistics for metrics.
    pub fn stats(&self) -> HandoverStats {
        self.stats
    }

    fn on_reply(&mut self, outcome: &RequestOutcome) -> Vec<Action> {
        let Some(mut transfer) = self.transfer.take() else {
            return vec![];
        };
        let target = transfer.target();
        let expected = transfer.expected_mode();

        let status = match outcome {
            Ok(payload) => match payload.as_device_status() {
                Some(status) => *status,
                None => {
                    let message = format!(
                        "reply from {} in transfer phase {} carried no device status",
                        target,
                        transfer.phase.name()
                    );
                    return self.abort(transfer, FaultCategory::Framework, target, message);
                }
            },
            Err(err) => {
                let category = if err.is_infrastructure() {
                    FaultCategory::Framework
                } else {
                    FaultCategory::Hardware
                };
                let message = format!(
                    "transfer phase {} request to {} failed: {}",
                    transfer.phase.name(),
                    target,
                    err
                );
                return self.abort(transfer, category, target, message);
            }
        };

        if status.mode != expected {
            let message = format!(
                "{} reported mode {} after a request for {} in transfer phase {}",
                target,
                status.mode,
                expected,
                transfer.phase.name()
            );
            return self.abort(transfer, FaultCategory::Hardware, target, message);
        }

        match transfer.phase.next() {
            Some(next) => {
                info!(phase = next.name(), %target, "transfer phase verified, advancing");
                transfer.phase = next;
                transfer.pending = self.alloc.next();
                let request = self.request_for(&transfer);
                self.transfer = Some(transfer);
                vec![request]
            }
            None => {
                self.stats.transfers_completed += 1;
                info!(
                    from = %transfer.from,
                    to = %transfer.to,
                    "reference transfer complete"
                );
                vec![]
            }
        }
    }

    /// Build the device command request for the transfer's current phase.
    fn request_for(&self, transfer: &Transfer) -> Action {
        let command = match transfer.phase {
            HandoverPhase::AssertOldDroop | HandoverPhase::EngageNew => DeviceCommand::SetMode {
                mode: DeviceMode::VoltageReference,
                grid_voltage_setpoint: Some(self.grid_voltage_setpoint),
                droop_ratio: Some(self.droop_ratio),
            },
            HandoverPhase::ReleaseOld => DeviceCommand::SetMode {
                mode: transfer.from_next_mode,
                grid_voltage_setpoint: None,
                droop_ratio: None,
            },
            HandoverPhase::StiffenNew => DeviceCommand::SetMode {
                mode: DeviceMode::VoltageReference,
                grid_voltage_setpoint: Some(self.grid_voltage_setpoint),
                droop_ratio: Some(0.0),
            },
        };
        Action::Request {
            to: Destination::Unit(transfer.target()),
            request: DeviceExecuteRequest::new(command).into(),
            request_id: transfer.pending,
            timeout: self.request_timeout,
        }
    }

    fn abort(
        &mut self,
        transfer: Transfer,
        category: FaultCategory,
        at_fault: UnitId,
        message: String,
    ) -> Vec<Action> {
        self.stats.transfers_aborted += 1;
        error!(
            from = %transfer.from,
            to = %transfer.to,
            phase = transfer.phase.name(),
            %message,
            "reference transfer aborted"
        );
        vec![self.raise(category, at_fault, message)]
    }

    fn raise(&self, category: FaultCategory, origin: UnitId, message: String) -> Action {
        let fault = FaultRecord::new(
            category,
            FaultScope::Local,
            FaultSeverity::Error,
            origin,
            message,
            "coordinator.handover",
            self.now.as_millis() as u64,
        );
        Action::Broadcast {
            message: FaultReportBroadcast::new(fault).into(),
        }
    }
}

impl SubStateMachine for HandoverState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::ReplyReceived { request_id, outcome }
                if self
                    .transfer
                    .as_ref()
                    .is_some_and(|t| t.pending == *request_id) =>
            {
                Some(self.on_reply(outcome))
            }
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
    use gridmesh_core::{OutboundMessage, OutboundRequest};
    use gridmesh_messages::{ReplyPayload, RequestError};
    use gridmesh_types::DeviceStatus;

    fn driver() -> HandoverState {
        HandoverState::new(UnitId(1), &Policy::default(), true)
    }

    /// Pull the single outstanding device request out of an action batch.
    fn device_request(actions: &[Action]) -> (UnitId, DeviceCommand, RequestId) {
        assert_eq!(actions.len(), 1, "expected exactly one action: {actions:?}");
        match &actions[0] {
            Action::Request {
                to: Destination::Unit(unit),
                request: OutboundRequest::DeviceExecute(request),
                request_id,
                ..
            } => (*unit, request.command().clone(), *request_id),
            other => panic!("expected device request, got {other:?}"),
        }
    }

    fn fault(actions: &[Action]) -> &FaultRecord {
        match &actions[0] {
            Action::Broadcast {
                message: OutboundMessage::FaultReport(report),
            } => report.fault(),
            other => panic!("expected fault broadcast, got {other:?}"),
        }
    }

    fn reply_with_mode(state: &mut HandoverState, request_id: RequestId, mode: DeviceMode) -> Vec<Action> {
        let status = DeviceStatus {
            mode,
            grid_voltage: 380.0,
            grid_current: 0.0,
        };
        state
            .try_handle(&Event::ReplyReceived {
                request_id,
                outcome: Ok(ReplyPayload::DeviceStatus(status)),
            })
            .unwrap()
    }

    #[test]
    fn test_full_transfer_walks_four_phases() {
        let mut state = driver();
        let actions = state.start(UnitId(2), UnitId(3), DeviceMode::Discharge);
        assert!(state.suppression_active());

        // Phase one: the outgoing unit re-asserts with a droop slope.
        let (target, command, id) = device_request(&actions);
        assert_eq!(target, UnitId(2));
        assert_eq!(
            command,
            DeviceCommand::SetMode {
                mode: DeviceMode::VoltageReference,
                grid_voltage_setpoint: Some(380.0),
                droop_ratio: Some(0.2),
            }
        );

        // Phase two: the incoming unit takes the role with the same slope.
        let actions = reply_with_mode(&mut state, id, DeviceMode::VoltageReference);
        let (target, command, id) = device_request(&actions);
        assert_eq!(target, UnitId(3));
        assert_eq!(
            command,
            DeviceCommand::SetMode {
                mode: DeviceMode::VoltageReference,
                grid_voltage_setpoint: Some(380.0),
                droop_ratio: Some(0.2),
            }
        );

        // Phase three: the outgoing unit falls back to its passive mode.
        let actions = reply_with_mode(&mut state, id, DeviceMode::VoltageReference);
        let (target, command, id) = device_request(&actions);
        assert_eq!(target, UnitId(2));
        assert_eq!(
            command,
            DeviceCommand::SetMode {
                mode: DeviceMode::Discharge,
                grid_voltage_setpoint: None,
                droop_ratio: None,
            }
        );

        // Phase four: the new reference stiffens to a zero slope.
        let actions = reply_with_mode(&mut state, id, DeviceMode::Discharge);
        let (target, command, id) = device_request(&actions);
        assert_eq!(target, UnitId(3));
        assert_eq!(
            command,
            DeviceCommand::SetMode {
                mode: DeviceMode::VoltageReference,
                grid_voltage_setpoint: Some(380.0),
                droop_ratio: Some(0.0),
            }
        );

        let actions = reply_with_mode(&mut state, id, DeviceMode::VoltageReference);
        assert!(actions.is_empty());
        assert!(!state.suppression_active());
        assert_eq!(state.stats().transfers_completed, 1);
    }

    #[test]
    fn test_mode_mismatch_aborts_with_fault_at_target() {
        let mut state = driver();
        let actions = state.start(UnitId(2), UnitId(3), DeviceMode::Charge);
        let (_, _, id) = device_request(&actions);
        let actions = reply_with_mode(&mut state, id, DeviceMode::VoltageReference);
        let (_, _, id) = device_request(&actions);

        // The incoming unit stayed in wait instead of taking the role.
        let actions = reply_with_mode(&mut state, id, DeviceMode::Wait);
        let fault = fault(&actions);
        assert_eq!(fault.category, FaultCategory::Hardware);
        assert_eq!(fault.scope, FaultScope::Local);
        assert_eq!(fault.severity, FaultSeverity::Error);
        assert_eq!(fault.origin_unit_id, UnitId(3));
        assert!(fault.message.contains("engage-new"));

        assert!(!state.suppression_active());
        assert_eq!(state.stats().transfers_aborted, 1);
        // No further phase was issued.
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_infrastructure_failure_aborts_as_framework_fault() {
        let mut state = driver();
        let actions = state.start(UnitId(2), UnitId(3), DeviceMode::Charge);
        let (_, _, id) = device_request(&actions);

        let actions = state
            .try_handle(&Event::ReplyReceived {
                request_id: id,
                outcome: Err(RequestError::timeout()),
            })
            .unwrap();
        let fault = fault(&actions);
        assert_eq!(fault.category, FaultCategory::Framework);
        assert_eq!(fault.origin_unit_id, UnitId(2));
        assert!(!state.suppression_active());
    }

    #[test]
    fn test_device_rejection_aborts_as_hardware_fault() {
        let mut state = driver();
        let actions = state.start(UnitId(2), UnitId(3), DeviceMode::Charge);
        let (_, _, id) = device_request(&actions);

        let actions = state
            .try_handle(&Event::ReplyReceived {
                request_id: id,
                outcome: Err(RequestError::rejected("device lock held")),
            })
            .unwrap();
        assert_eq!(fault(&actions).category, FaultCategory::Hardware);
    }

    #[test]
    fn test_second_start_refused_while_in_flight() {
        let mut state = driver();
        state.start(UnitId(2), UnitId(3), DeviceMode::Charge);
        assert!(state.start(UnitId(3), UnitId(4), DeviceMode::Charge).is_empty());
        assert_eq!(state.stats().transfers_refused, 1);
    }

    #[test]
    fn test_non_coordinator_refuses() {
        let mut state = HandoverState::new(UnitId(2), &Policy::default(), false);
        assert!(state.start(UnitId(2), UnitId(3), DeviceMode::Charge).is_empty());
        assert!(!state.suppression_active());
    }

    #[test]
    fn test_zero_droop_ratio_refused_with_fault() {
        let policy = Policy {
            droop_ratio: 0.0,
            ..Policy::default()
        };
        let mut state = HandoverState::new(UnitId(1), &policy, true);

        let actions = state.start(UnitId(2), UnitId(3), DeviceMode::Charge);
        let fault = fault(&actions);
        assert_eq!(fault.category, FaultCategory::User);
        assert!(!state.suppression_active());
    }

    #[test]
    fn test_unrelated_replies_not_claimed() {
        let mut state = driver();
        let actions = state.start(UnitId(2), UnitId(3), DeviceMode::Charge);
        let (_, _, id) = device_request(&actions);

        let unrelated = Event::ReplyReceived {
            request_id: RequestId(id.0 + 100),
            outcome: Ok(ReplyPayload::Ack),
        };
        assert!(state.try_handle(&unrelated).is_none());
        // Still waiting on the real reply.
        assert!(state.suppression_active());
    }

    #[test]
    fn test_demotion_abandons_transfer_without_fault() {
        let mut state = driver();
        let actions = state.start(UnitId(2), UnitId(3), DeviceMode::Charge);
        let (_, _, id) = device_request(&actions);

        state.demote();
        assert!(!state.suppression_active());
        assert_eq!(state.stats().transfers_aborted, 0);

        // A late reply for the abandoned request is no longer claimed.
        let late = Event::ReplyReceived {
            request_id: id,
            outcome: Ok(ReplyPayload::Ack),
        };
        assert!(state.try_handle(&late).is_none());
    }
}
