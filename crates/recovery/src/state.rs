//! Escalation dispatcher sub-state machine.

use crate::matrix::{sequence_for, Primitive};
use gridmesh_core::{
    Action, Destination, Event, RequestId, RequestIdAllocator, SubStateMachine, TimerId,
};
use gridmesh_faults::{FaultCollector, FaultCollectorStats};
use gridmesh_messages::{
    DemoteRequest, DisposeDealRequest, FaultReportBroadcast, GlobalModeBroadcast, ReplyPayload,
    RequestOutcome, ResetAllBroadcast, ScramBroadcast, ShutdownAllBroadcast, StopDealRequest,
};
use gridmesh_types::{
    DealId, DealLedger, DeviceCommand, DeviceStatus, FaultCategory, FaultRecord, FaultScope,
    FaultSeverity, OperationMode, Policy, UnitId,
};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Request-id scope for recovery primitives, so replies and device
/// completions can be routed back here without consulting the other
/// sub-machines.
const RECOVERY_SCOPE: u8 = 2;

/// One cell's worth of recovery work: the sequence for the cell plus the
/// de-duplicated fault descriptions, logged at each point of effect.
#[derive(Debug)]
struct SequenceRun {
    scope: FaultScope,
    category: FaultCategory,
    severity: FaultSeverity,
    reasons: Vec<String>,
    steps: VecDeque<Primitive>,
}

/// Wait state of the primitive currently executing. At most one primitive
/// is ever in flight.
#[derive(Debug)]
enum StepWait {
    /// Stop requests are out to the deal service. Success is decided on
    /// each poll by re-checking the ledger, not by counting replies.
    StopDeals {
        outstanding: BTreeSet<RequestId>,
        reasons: Vec<String>,
    },
    /// A stop command delegated to the local device adapter.
    Device { pending: RequestId },
    /// A demotion request out to the coordinator.
    Demote { pending: RequestId },
    /// First scram broadcast sent; the settle delay is running.
    ScramSettle { reasons: Vec<String> },
    /// Second scram broadcast sent; deals are disposed one at a time.
    ScramDispose {
        pending: RequestId,
        pending_deal: DealId,
        remaining: VecDeque<DealId>,
    },
}

/// Periodic fault sweep and recovery sequence driver.
///
/// Also owns this unit's interchange ledger, mirrored from the deal
/// notifications on the bus; other components read it through
/// [`RecoveryState::ledger`].
#[derive(Debug)]
pub struct RecoveryState {
    unit_id: UnitId,

    sweep_interval: Duration,
    scram_settle_delay: Duration,
    stop_poll_interval: Duration,
    stop_timeout: Duration,
    request_timeout: Duration,

    collector: FaultCollector,
    ledger: DealLedger,

    /// Sequences queued by the sweep in progress.
    sweep_queue: VecDeque<SequenceRun>,
    /// The sequence currently executing.
    current: Option<SequenceRun>,
    /// Async wait state of the current step.
    wait: Option<StepWait>,
    /// A sweep is in progress; the timer is re-armed only when it ends.
    sweeping: bool,

    /// Set once a halt has been issued; nothing runs after that.
    halted: bool,

    alloc: RequestIdAllocator,

    /// Current time.
    now: Duration,

    stats: RecoveryStats,
}

/// Statistics from the escalation dispatcher for metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    /// Sweeps started.
    pub sweeps: u64,
    /// Recovery sequences run.
    pub sequences_run: u64,
    /// Faults this dispatcher raised about its own recovery traffic.
    pub secondary_faults: u64,
}

impl RecoveryState {
    pub fn new(unit_id: UnitId, policy: &Policy, is_coordinator: bool) -> Self {
        Self {
            unit_id,
            sweep_interval: policy.sweep_interval,
            scram_settle_delay: policy.scram_settle_delay,
            stop_poll_interval: policy.stop_poll_interval,
            stop_timeout: policy.stop_timeout,
            request_timeout: policy.request_timeout,
            collector: FaultCollector::new(unit_id, policy, is_coordinator),
            ledger: DealLedger::new(),
            sweep_queue: VecDeque::new(),
            current: None,
            wait: None,
            sweeping: false,
            halted: false,
            alloc: RequestIdAllocator::scoped(RECOVERY_SCOPE),
            now: Duration::ZERO,
            stats: RecoveryStats::default(),
        }
    }

    /// Arm the first sweep.
    pub fn initialize(&mut self) -> Vec<Action> {
        vec![Action::SetTimer {
            id: TimerId::Sweep,
            duration: self.sweep_interval,
        }]
    }

    /// The interchange read-model, for components that need deal fields
    /// without owning a second mirror.
    pub fn ledger(&self) -> &DealLedger {
        &self.ledger
    }

    /// Whether this unit currently reports an active fault.
    pub fn has_active_fault(&self) -> bool {
        self.collector.has_active_fault(self.now)
    }

    /// Give up the coordinator role: queued global faults move to the new
    /// coordinator's responsibility. A global sequence already executing
    /// runs to completion; it was the consuming dispatcher when it began.
    pub fn demote(&mut self) {
        self.collector.demote();
    }

    /// Get statistics for metrics.
    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }

    pub fn collector_stats(&self) -> FaultCollectorStats {
        self.collector.stats()
    }

    fn on_fault(&mut self, fault: &FaultRecord) -> Vec<Action> {
        self.collector.record(fault.clone());
        vec![]
    }

    fn on_fault_query(&mut self, request_id: RequestId) -> Vec<Action> {
        let active = self.collector.has_active_fault(self.now);
        vec![Action::Reply {
            request_id,
            outcome: Ok(ReplyPayload::HasActiveFault(active)),
        }]
    }

    /// Start one sweep: drain every cell of the category and severity
    /// cross product and queue the matching sequences.
    fn on_sweep(&mut self) -> Vec<Action> {
        if self.halted {
            return vec![];
        }
        if self.sweeping {
            warn!("sweep timer fired while the previous sweep is still running");
            return vec![];
        }
        self.sweeping = true;
        self.stats.sweeps += 1;

        for category in FaultCategory::ALL {
            for severity in FaultSeverity::ALL {
                let faults = self.collector.drain(category, severity);
                if faults.is_empty() {
                    continue;
                }
                if severity == FaultSeverity::Warn {
                    error!(
                        count = faults.len(),
                        %category,
                        "advisory faults were queued; the collector must never store them"
                    );
                    continue;
                }
                // Cluster-wide measures come before this unit's own.
                for scope in [FaultScope::Global, FaultScope::Local] {
                    let reasons = dedup_reasons(faults.iter().filter(|f| f.scope == scope));
                    if reasons.is_empty() {
                        continue;
                    }
                    let steps = sequence_for(scope, category, severity);
                    self.sweep_queue.push_back(SequenceRun {
                        scope,
                        category,
                        severity,
                        reasons,
                        steps: steps.into(),
                    });
                }
            }
        }

        self.pump()
    }

    /// Run the sweep forward until it blocks on an async step or ends.
    fn pump(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            if self.halted || self.wait.is_some() {
                break;
            }

            let next_step = match &mut self.current {
                Some(run) => match run.steps.pop_front() {
                    Some(step) => Some((step, run.reasons.clone())),
                    None => {
                        debug!(
                            scope = %run.scope,
                            category = %run.category,
                            "recovery sequence complete"
                        );
                        self.current = None;
                        continue;
                    }
                },
                None => None,
            };

            match next_step {
                Some((step, reasons)) => {
                    info!(step = step.name(), "recovery step");
                    actions.extend(self.begin_step(step, reasons));
                }
                None => match self.sweep_queue.pop_front() {
                    Some(run) => {
                        info!(
                            scope = %run.scope,
                            category = %run.category,
                            severity = %run.severity,
                            reasons = ?run.reasons,
                            "starting recovery sequence"
                        );
                        self.stats.sequences_run += 1;
                        self.current = Some(run);
                    }
                    None => {
                        if self.sweeping {
                            self.sweeping = false;
                            self.collector.mark_handled(self.now);
                            actions.push(Action::SetTimer {
                                id: TimerId::Sweep,
                                duration: self.sweep_interval,
                            });
                        }
                        break;
                    }
                },
            }
        }
        actions
    }

    fn begin_step(&mut self, step: Primitive, reasons: Vec<String>) -> Vec<Action> {
        match step {
            Primitive::AskWaitStopDeals => self.begin_stop_deals(reasons),
            Primitive::StopDevice => {
                let pending = self.alloc.next();
                self.wait = Some(StepWait::Device { pending });
                vec![Action::ExecuteDeviceCommand {
                    request_id: Some(pending),
                    command: DeviceCommand::Stop,
                }]
            }
            Primitive::EnterStopping => {
                vec![Action::EnqueueInternal {
                    event: Event::StoppingEntered { reasons },
                }]
            }
            Primitive::DemoteCoordinator => {
                let pending = self.alloc.next();
                self.wait = Some(StepWait::Demote { pending });
                vec![Action::Request {
                    to: Destination::Coordinator,
                    request: DemoteRequest::new(reasons).into(),
                    request_id: pending,
                    timeout: self.request_timeout,
                }]
            }
            Primitive::ResetSelf => self.halt(true, reasons),
            Primitive::ShutdownSelf => self.halt(false, reasons),
            Primitive::Scram => {
                self.wait = Some(StepWait::ScramSettle {
                    reasons: reasons.clone(),
                });
                vec![
                    Action::Broadcast {
                        message: ScramBroadcast::new(true, reasons).into(),
                    },
                    Action::SetTimer {
                        id: TimerId::Settle,
                        duration: self.scram_settle_delay,
                    },
                ]
            }
            Primitive::ForceGlobalStop => {
                vec![Action::Broadcast {
                    message: GlobalModeBroadcast::new(OperationMode::Stop, reasons).into(),
                }]
            }
            Primitive::ResetAll => {
                vec![Action::Broadcast {
                    message: ResetAllBroadcast::new(reasons).into(),
                }]
            }
            Primitive::ShutdownAll => {
                vec![Action::Broadcast {
                    message: ShutdownAllBroadcast::new(reasons).into(),
                }]
            }
        }
    }

    fn halt(&mut self, restart: bool, reasons: Vec<String>) -> Vec<Action> {
        self.halted = true;
        info!(restart, "recovery is taking this unit down");
        vec![Action::Halt { restart, reasons }]
    }

    fn begin_stop_deals(&mut self, reasons: Vec<String>) -> Vec<Action> {
        let targets = self.ledger.undeactivated_for(self.unit_id);
        if targets.is_empty() {
            debug!("no undeactivated interchanges to stop");
            return vec![];
        }

        info!(deals = ?targets, "asking the deal service to stop interchanges");
        let mut outstanding = BTreeSet::new();
        let mut actions = Vec::new();
        for deal_id in targets {
            let request_id = self.alloc.next();
            outstanding.insert(request_id);
            actions.push(Action::Request {
                to: Destination::DealService,
                request: StopDealRequest::new(deal_id, reasons.clone()).into(),
                request_id,
                timeout: self.request_timeout,
            });
        }
        actions.push(Action::SetTimer {
            id: TimerId::StopPoll,
            duration: self.stop_poll_interval,
        });
        actions.push(Action::SetTimer {
            id: TimerId::StopDeadline,
            duration: self.stop_timeout,
        });
        self.wait = Some(StepWait::StopDeals {
            outstanding,
            reasons,
        });
        actions
    }

    fn on_stop_poll(&mut self) -> Vec<Action> {
        let Some(StepWait::StopDeals { reasons, .. }) = &self.wait else {
            warn!("stale stop-poll timer");
            return vec![];
        };
        let reasons = reasons.clone();

        let targets = self.ledger.undeactivated_for(self.unit_id);
        if targets.is_empty() {
            info!("all interchanges stopped");
            self.wait = None;
            let mut actions = vec![Action::CancelTimer {
                id: TimerId::StopDeadline,
            }];
            actions.extend(self.pump());
            return actions;
        }

        debug!(remaining = targets.len(), "re-asking for interchange stops");
        let mut outstanding = BTreeSet::new();
        let mut actions = Vec::new();
        for deal_id in targets {
            let request_id = self.alloc.next();
            outstanding.insert(request_id);
            actions.push(Action::Request {
                to: Destination::DealService,
                request: StopDealRequest::new(deal_id, reasons.clone()).into(),
                request_id,
                timeout: self.request_timeout,
            });
        }
        actions.push(Action::SetTimer {
            id: TimerId::StopPoll,
            duration: self.stop_poll_interval,
        });
        self.wait = Some(StepWait::StopDeals {
            outstanding,
            reasons,
        });
        actions
    }

    fn on_stop_deadline(&mut self) -> Vec<Action> {
        if !matches!(self.wait, Some(StepWait::StopDeals { .. })) {
            warn!("stale stop-deadline timer");
            return vec![];
        }
        let remaining = self.ledger.undeactivated_for(self.unit_id);
        error!(
            ?remaining,
            "interchanges still undeactivated at the stop deadline, giving up"
        );
        self.wait = None;
        let mut actions = vec![Action::CancelTimer {
            id: TimerId::StopPoll,
        }];
        actions.extend(self.pump());
        actions
    }

    fn on_settle(&mut self) -> Vec<Action> {
        let Some(StepWait::ScramSettle { reasons }) = self.wait.take() else {
            warn!("stale settle timer");
            return vec![];
        };

        info!("scram settle elapsed, stopping the voltage reference too");
        let mut actions = vec![Action::Broadcast {
            message: ScramBroadcast::new(false, reasons).into(),
        }];

        // Claim every known interchange, then dispose them one by one.
        let mut ids: VecDeque<DealId> = self.ledger.deal_ids().into();
        for id in &ids {
            self.ledger.mark_scrammed(*id);
        }
        match ids.pop_front() {
            Some(first) => {
                info!(deals = ids.len() + 1, "disposing interchanges");
                let request_id = self.alloc.next();
                actions.push(self.dispose_request(first, request_id));
                self.wait = Some(StepWait::ScramDispose {
                    pending: request_id,
                    pending_deal: first,
                    remaining: ids,
                });
            }
            None => {
                debug!("no interchanges to dispose");
                actions.extend(self.pump());
            }
        }
        actions
    }

    fn dispose_request(&self, deal_id: DealId, request_id: RequestId) -> Action {
        Action::Request {
            to: Destination::DealService,
            request: DisposeDealRequest::new(deal_id).into(),
            request_id,
            timeout: self.request_timeout,
        }
    }

    fn on_reply(&mut self, request_id: RequestId, outcome: &RequestOutcome) -> Vec<Action> {
        match self.wait.take() {
            Some(StepWait::StopDeals {
                mut outstanding,
                reasons,
            }) if outstanding.contains(&request_id) => {
                outstanding.remove(&request_id);
                let mut actions = Vec::new();
                match outcome {
                    Ok(_) => debug!(%request_id, "stop request acknowledged"),
                    Err(err) if err.is_rejected() || err.is_not_found() => {
                        debug!(%request_id, %err, "stop request turned away");
                    }
                    Err(err) => {
                        warn!(%request_id, %err, "stop request failed in transit");
                        actions.push(
                            self.secondary_fault(format!("interchange stop request failed: {err}")),
                        );
                    }
                }
                self.wait = Some(StepWait::StopDeals {
                    outstanding,
                    reasons,
                });
                actions
            }
            Some(StepWait::Demote { pending }) if pending == request_id => match outcome {
                Ok(_) => {
                    info!("coordinator demotion acknowledged");
                    self.pump()
                }
                Err(err) if err.is_rejected() || err.is_not_found() => {
                    warn!(%err, "coordinator demotion turned away");
                    self.pump()
                }
                Err(err) => {
                    // Demotion that cannot even be delivered leaves an
                    // unaccountable coordinator; this unit takes itself out.
                    error!(%err, "coordinator demotion failed, forcing shutdown");
                    let mut actions =
                        vec![self.secondary_fault(format!("coordinator demotion failed: {err}"))];
                    if let Some(run) = &mut self.current {
                        run.steps.push_front(Primitive::ShutdownSelf);
                    }
                    actions.extend(self.pump());
                    actions
                }
            },
            Some(StepWait::ScramDispose {
                pending,
                pending_deal,
                mut remaining,
            }) if pending == request_id => {
                let mut actions = Vec::new();
                match outcome {
                    Ok(_) => debug!(deal = %pending_deal, "interchange disposed"),
                    Err(err) if err.is_not_found() => {
                        debug!(deal = %pending_deal, "interchange already gone");
                    }
                    Err(err) if err.is_rejected() => {
                        warn!(deal = %pending_deal, %err, "interchange disposal rejected");
                    }
                    Err(err) => {
                        warn!(deal = %pending_deal, %err, "interchange disposal failed in transit");
                        actions.push(self.secondary_fault(format!(
                            "disposal of {pending_deal} failed: {err}"
                        )));
                    }
                }
                match remaining.pop_front() {
                    Some(next) => {
                        let request_id = self.alloc.next();
                        actions.push(self.dispose_request(next, request_id));
                        self.wait = Some(StepWait::ScramDispose {
                            pending: request_id,
                            pending_deal: next,
                            remaining,
                        });
                    }
                    None => {
                        info!("scram disposal pass complete");
                        actions.extend(self.pump());
                    }
                }
                actions
            }
            other => {
                self.wait = other;
                debug!(%request_id, "late reply for a finished recovery step");
                vec![]
            }
        }
    }

    fn on_device_result(
        &mut self,
        request_id: RequestId,
        result: &Result<DeviceStatus, String>,
    ) -> Vec<Action> {
        match self.wait.take() {
            Some(StepWait::Device { pending }) if pending == request_id => {
                match result {
                    Ok(status) => info!(mode = %status.mode, "local device stopped"),
                    Err(err) => error!(%err, "local device stop failed"),
                }
                self.pump()
            }
            other => {
                self.wait = other;
                debug!(%request_id, "late device result for a finished recovery step");
                vec![]
            }
        }
    }

    fn secondary_fault(&mut self, message: String) -> Action {
        self.stats.secondary_faults += 1;
        let fault = FaultRecord::new(
            FaultCategory::Framework,
            FaultScope::Local,
            FaultSeverity::Error,
            self.unit_id,
            message,
            "unit.recovery",
            self.now.as_millis() as u64,
        );
        Action::Broadcast {
            message: FaultReportBroadcast::new(fault).into(),
        }
    }
}

fn dedup_reasons<'a>(faults: impl Iterator<Item = &'a FaultRecord>) -> Vec<String> {
    let mut reasons = Vec::new();
    for fault in faults {
        let reason = fault.to_string();
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
    }
    reasons
}

impl SubStateMachine for RecoveryState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::SweepTimer => Some(self.on_sweep()),
            Event::StopPollTimer => Some(self.on_stop_poll()),
            Event::StopDeadlineTimer => Some(self.on_stop_deadline()),
            Event::SettleTimer => Some(self.on_settle()),
            Event::FaultReported { fault } => Some(self.on_fault(fault)),
            Event::FaultQueryRequested { request_id } => Some(self.on_fault_query(*request_id)),
            Event::ReplyReceived {
                request_id,
                outcome,
            } if request_id.scope() == RECOVERY_SCOPE => {
                Some(self.on_reply(*request_id, outcome))
            }
            Event::DeviceCommandCompleted {
                request_id: Some(id),
                result,
            } if id.scope() == RECOVERY_SCOPE => Some(self.on_device_result(*id, result)),
            Event::DealRegistered { deal } | Event::DealUpdated { deal } => {
                debug!(deal = %deal.deal_id, "interchange ledger updated");
                self.ledger.upsert(deal.clone());
                Some(vec![])
            }
            Event::DealRemoved { deal_id } => {
                debug!(deal = %deal_id, "interchange removed from ledger");
                self.ledger.remove(*deal_id);
                Some(vec![])
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
    use gridmesh_messages::RequestError;
    use gridmesh_types::test_utils::{test_deal, test_fault};
    use gridmesh_types::{DealRecord, SideActivity};

    fn dispatcher() -> RecoveryState {
        RecoveryState::new(UnitId(1), &Policy::default(), true)
    }

    fn report(state: &mut RecoveryState, fault: FaultRecord) {
        state
            .try_handle(&Event::FaultReported { fault })
            .expect("recovery claims fault reports");
    }

    fn sweep(state: &mut RecoveryState) -> Vec<Action> {
        state.try_handle(&Event::SweepTimer).expect("claims sweeps")
    }

    fn register_deal(state: &mut RecoveryState, deal: DealRecord) {
        state
            .try_handle(&Event::DealRegistered { deal })
            .expect("recovery claims deal events");
    }

    /// The single outstanding request in a batch, as (destination, request, id).
    fn requests(actions: &[Action]) -> Vec<(&Destination, &OutboundRequest, RequestId)> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Request {
                    to,
                    request,
                    request_id,
                    ..
                } => Some((to, request, *request_id)),
                _ => None,
            })
            .collect()
    }

    fn broadcasts(actions: &[Action]) -> Vec<&OutboundMessage> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Broadcast { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn timer_sets(actions: &[Action]) -> Vec<TimerId> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::SetTimer { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn device_stop_id(actions: &[Action]) -> RequestId {
        actions
            .iter()
            .find_map(|action| match action {
                Action::ExecuteDeviceCommand {
                    request_id: Some(id),
                    command: DeviceCommand::Stop,
                } => Some(*id),
                _ => None,
            })
            .expect("expected a delegated device stop")
    }

    fn reply(state: &mut RecoveryState, request_id: RequestId, outcome: RequestOutcome) -> Vec<Action> {
        state
            .try_handle(&Event::ReplyReceived {
                request_id,
                outcome,
            })
            .expect("recovery claims its own replies")
    }

    fn device_done(state: &mut RecoveryState, request_id: RequestId) -> Vec<Action> {
        state
            .try_handle(&Event::DeviceCommandCompleted {
                request_id: Some(request_id),
                result: Ok(DeviceStatus::default()),
            })
            .expect("recovery claims its own device completions")
    }

    #[test]
    fn test_initialize_arms_sweep_timer() {
        let mut state = dispatcher();
        assert_eq!(timer_sets(&state.initialize()), vec![TimerId::Sweep]);
    }

    #[test]
    fn test_fault_query_reflects_collector() {
        let mut state = dispatcher();
        let actions = state
            .try_handle(&Event::FaultQueryRequested {
                request_id: RequestId(900),
            })
            .unwrap();
        match &actions[0] {
            Action::Reply { outcome, .. } => {
                assert_eq!(*outcome, Ok(ReplyPayload::HasActiveFault(false)));
            }
            other => panic!("expected reply, got {other:?}"),
        }

        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Local,
                FaultSeverity::Error,
                1,
            ),
        );
        assert!(state.has_active_fault());
    }

    #[test]
    fn test_empty_sweep_only_rearms() {
        let mut state = dispatcher();
        let actions = sweep(&mut state);
        assert_eq!(timer_sets(&actions), vec![TimerId::Sweep]);
        assert_eq!(actions.len(), 1);
        assert!(!state.has_active_fault());
    }

    #[test]
    fn test_warn_fault_schedules_no_work() {
        let mut state = dispatcher();
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Global,
                FaultSeverity::Warn,
                1,
            ),
        );
        let actions = sweep(&mut state);
        assert_eq!(timer_sets(&actions), vec![TimerId::Sweep]);
        assert!(!state.has_active_fault());
    }

    #[test]
    fn test_local_hardware_error_stops_device_then_sustains() {
        let mut state = dispatcher();
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Local,
                FaultSeverity::Error,
                1,
            ),
        );

        // No deals: the ask-and-wait step completes immediately and the
        // device stop goes out.
        let actions = sweep(&mut state);
        let stop_id = device_stop_id(&actions);

        let actions = device_done(&mut state, stop_id);
        assert_eq!(timer_sets(&actions), vec![TimerId::Sweep], "sweep re-armed");

        // Handling completed: the sustain window holds the fault active.
        assert!(state.has_active_fault());
        state.set_time(Duration::from_secs(35));
        assert!(!state.has_active_fault());
    }

    #[test]
    fn test_ask_wait_polls_until_deal_deactivates() {
        let mut state = dispatcher();
        register_deal(&mut state, test_deal(7, 1, 2));
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Local,
                FaultSeverity::Error,
                1,
            ),
        );

        let actions = sweep(&mut state);
        let reqs = requests(&actions);
        assert_eq!(reqs.len(), 1);
        assert_eq!(*reqs[0].0, Destination::DealService);
        assert!(matches!(reqs[0].1, OutboundRequest::StopDeal(r) if r.deal_id == DealId(7)));
        assert_eq!(
            timer_sets(&actions),
            vec![TimerId::StopPoll, TimerId::StopDeadline]
        );

        // Acknowledged, but the deal is still active: the poll re-asks.
        reply(&mut state, reqs[0].2, Ok(ReplyPayload::Ack));
        let actions = state.try_handle(&Event::StopPollTimer).unwrap();
        assert_eq!(requests(&actions).len(), 1);
        assert_eq!(timer_sets(&actions), vec![TimerId::StopPoll]);

        // The deal service deactivates our side; the next poll moves on.
        let mut done = test_deal(7, 1, 2);
        done.discharge_activity = SideActivity::Deactivated;
        state
            .try_handle(&Event::DealUpdated { deal: done })
            .unwrap();

        let actions = state.try_handle(&Event::StopPollTimer).unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CancelTimer { id: TimerId::StopDeadline })));
        device_stop_id(&actions);
    }

    #[test]
    fn test_ask_wait_deadline_fails_but_chain_continues() {
        let mut state = dispatcher();
        register_deal(&mut state, test_deal(7, 1, 2));
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Local,
                FaultSeverity::Error,
                1,
            ),
        );
        sweep(&mut state);

        // The deal never deactivates; the deadline gives up and the
        // device stop still runs.
        let actions = state.try_handle(&Event::StopDeadlineTimer).unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CancelTimer { id: TimerId::StopPoll })));
        device_stop_id(&actions);
    }

    #[test]
    fn test_local_logic_error_demotes_and_resets() {
        let mut state = dispatcher();
        report(
            &mut state,
            test_fault(
                FaultCategory::Logic,
                FaultScope::Local,
                FaultSeverity::Error,
                1,
            ),
        );

        let actions = sweep(&mut state);
        let stop_id = device_stop_id(&actions);

        let actions = device_done(&mut state, stop_id);
        let reqs = requests(&actions);
        assert_eq!(reqs.len(), 1);
        assert_eq!(*reqs[0].0, Destination::Coordinator);
        assert!(matches!(reqs[0].1, OutboundRequest::Demote(_)));

        let actions = reply(&mut state, reqs[0].2, Ok(ReplyPayload::Ack));
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::Halt { restart: true, .. })),
            "reset-self restarts the process"
        );
    }

    #[test]
    fn test_demotion_failure_forces_shutdown() {
        let mut state = dispatcher();
        report(
            &mut state,
            test_fault(
                FaultCategory::Logic,
                FaultScope::Local,
                FaultSeverity::Error,
                1,
            ),
        );
        let actions = sweep(&mut state);
        let stop_id = device_stop_id(&actions);
        let actions = device_done(&mut state, stop_id);
        let demote_id = requests(&actions)[0].2;

        let actions = reply(&mut state, demote_id, Err(RequestError::timeout()));
        let faults: Vec<_> = broadcasts(&actions)
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::FaultReport(report) => Some(report.fault()),
                _ => None,
            })
            .collect();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].category, FaultCategory::Framework);
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::Halt { restart: false, .. })),
            "shutdown, not the reset the sequence would have run"
        );
    }

    #[test]
    fn test_global_hardware_error_scrams_then_stops_trading() {
        let mut state = dispatcher();
        register_deal(&mut state, test_deal(7, 2, 3));
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Global,
                FaultSeverity::Error,
                2,
            ),
        );

        // First stage: stop everything except the voltage reference.
        let actions = sweep(&mut state);
        let msgs = broadcasts(&actions);
        assert!(
            matches!(msgs[0], OutboundMessage::Scram(s) if s.exclude_voltage_reference),
            "first scram stage spares the reference"
        );
        assert_eq!(timer_sets(&actions), vec![TimerId::Settle]);

        // Second stage: stop the reference too, then dispose the deal.
        let actions = state.try_handle(&Event::SettleTimer).unwrap();
        let msgs = broadcasts(&actions);
        assert!(matches!(msgs[0], OutboundMessage::Scram(s) if !s.exclude_voltage_reference));
        assert!(state.ledger().get(DealId(7)).unwrap().scrammed);
        let reqs = requests(&actions);
        assert!(matches!(reqs[0].1, OutboundRequest::DisposeDeal(r) if r.deal_id == DealId(7)));

        // Disposal done: trading is forced to stop and the sweep ends.
        let actions = reply(&mut state, reqs[0].2, Ok(ReplyPayload::Ack));
        let msgs = broadcasts(&actions);
        assert!(
            matches!(msgs[0], OutboundMessage::GlobalMode(m) if m.mode == OperationMode::Stop)
        );
        assert_eq!(timer_sets(&actions), vec![TimerId::Sweep]);
    }

    #[test]
    fn test_scram_disposal_ignores_missing_deals() {
        let mut state = dispatcher();
        register_deal(&mut state, test_deal(1, 2, 3));
        register_deal(&mut state, test_deal(2, 3, 4));
        report(
            &mut state,
            test_fault(
                FaultCategory::User,
                FaultScope::Global,
                FaultSeverity::Error,
                2,
            ),
        );
        sweep(&mut state);
        let actions = state.try_handle(&Event::SettleTimer).unwrap();
        let first = requests(&actions)[0].2;

        // The first deal raced normal completion and is already gone.
        let actions = reply(
            &mut state,
            first,
            Err(RequestError::not_found("no such deal")),
        );
        assert!(broadcasts(&actions).is_empty(), "not-found is not a fault");
        let second = requests(&actions)[0].2;

        let actions = reply(&mut state, second, Ok(ReplyPayload::Ack));
        // User-category global sequence is scram only: sweep completes.
        assert_eq!(timer_sets(&actions), vec![TimerId::Sweep]);
    }

    #[test]
    fn test_global_logic_error_resets_cluster() {
        let mut state = dispatcher();
        report(
            &mut state,
            test_fault(
                FaultCategory::Logic,
                FaultScope::Global,
                FaultSeverity::Error,
                3,
            ),
        );
        sweep(&mut state);

        // No deals to dispose: settle completes the scram directly.
        let actions = state.try_handle(&Event::SettleTimer).unwrap();
        let msgs = broadcasts(&actions);
        assert!(matches!(msgs[0], OutboundMessage::Scram(_)));
        assert!(matches!(msgs[1], OutboundMessage::ResetAll(_)));
    }

    #[test]
    fn test_fatal_local_fault_shuts_unit_down() {
        let mut state = dispatcher();
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Local,
                FaultSeverity::Fatal,
                1,
            ),
        );

        let actions = sweep(&mut state);
        let stop_id = device_stop_id(&actions);

        let actions = device_done(&mut state, stop_id);
        assert!(
            actions.iter().any(|a| matches!(
                a,
                Action::EnqueueInternal {
                    event: Event::StoppingEntered { .. }
                }
            )),
            "the unit marks itself stopping before it goes down"
        );
        let demote_id = requests(&actions)[0].2;

        let actions = reply(&mut state, demote_id, Ok(ReplyPayload::Ack));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Halt { restart: false, .. })));
    }

    #[test]
    fn test_unknown_category_error_joins_fatal_path() {
        let mut state = dispatcher();
        report(
            &mut state,
            test_fault(
                FaultCategory::Unknown,
                FaultScope::Local,
                FaultSeverity::Error,
                1,
            ),
        );
        let actions = sweep(&mut state);
        let stop_id = device_stop_id(&actions);
        let actions = device_done(&mut state, stop_id);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::EnqueueInternal {
                event: Event::StoppingEntered { .. }
            }
        )));
    }

    #[test]
    fn test_global_runs_before_local_in_same_cell() {
        let mut state = dispatcher();
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Global,
                FaultSeverity::Error,
                2,
            ),
        );
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Local,
                FaultSeverity::Error,
                1,
            ),
        );

        // The cluster-wide scram comes first.
        let actions = sweep(&mut state);
        assert!(matches!(broadcasts(&actions)[0], OutboundMessage::Scram(_)));

        // After the global sequence drains, the local one stops our device.
        let actions = state.try_handle(&Event::SettleTimer).unwrap();
        assert!(matches!(
            broadcasts(&actions)[1],
            OutboundMessage::GlobalMode(_)
        ));
        device_stop_id(&actions);
    }

    #[test]
    fn test_reasons_are_deduplicated() {
        let mut state = dispatcher();
        let mut first = test_fault(
            FaultCategory::User,
            FaultScope::Global,
            FaultSeverity::Error,
            2,
        );
        first.timestamp_ms = 100;
        let mut second = first.clone();
        second.timestamp_ms = 200;
        report(&mut state, first);
        report(&mut state, second);

        let actions = sweep(&mut state);
        match broadcasts(&actions)[0] {
            OutboundMessage::Scram(scram) => assert_eq!(scram.reasons.len(), 1),
            other => panic!("expected scram, got {other:?}"),
        }
    }

    #[test]
    fn test_non_coordinator_never_handles_global_faults() {
        let mut state = RecoveryState::new(UnitId(2), &Policy::default(), false);
        report(
            &mut state,
            test_fault(
                FaultCategory::Hardware,
                FaultScope::Global,
                FaultSeverity::Error,
                3,
            ),
        );
        let actions = sweep(&mut state);
        assert_eq!(timer_sets(&actions), vec![TimerId::Sweep]);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_foreign_replies_are_not_claimed() {
        let mut state = dispatcher();
        // Scope 1 belongs to the handover driver.
        let foreign = Event::ReplyReceived {
            request_id: RequestId(1u64 << 56),
            outcome: Ok(ReplyPayload::Ack),
        };
        assert!(state.try_handle(&foreign).is_none());
    }
}
