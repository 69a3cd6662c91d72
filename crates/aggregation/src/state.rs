//! Aggregation sub-state machine.

use gridmesh_core::{Action, Event, RequestId, SubStateMachine, TimerId};
use gridmesh_messages::{
    FaultReportBroadcast, ReplyPayload, RequestError, TelemetryRequestBroadcast,
};
use gridmesh_types::{
    FaultCategory, FaultRecord, FaultScope, FaultSeverity, Policy, TelemetrySnapshot, UnitId,
    UnitTelemetry,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One collection round in flight.
#[derive(Debug)]
struct OpenRound {
    round: u64,
    started_at: Duration,
    replies: BTreeMap<UnitId, UnitTelemetry>,
}

/// Telemetry aggregation state machine (coordinator side).
///
/// Owns the round lifecycle, the snapshot cache, and the callers parked
/// on the cached-telemetry address. The member-side answer to a round is
/// produced by the composition root, which owns the local telemetry
/// mirrors.
#[derive(Debug)]
pub struct AggregationState {
    unit_id: UnitId,
    is_coordinator: bool,

    /// Expected cluster membership.
    members: BTreeSet<UnitId>,

    /// Cadence at which rounds open.
    collection_interval: Duration,

    /// Reply window per round.
    collection_timeout: Duration,

    /// Next round number to assign.
    next_round: u64,

    /// The round currently collecting replies, if any.
    open: Option<OpenRound>,

    /// Last completed snapshot.
    cache: Option<TelemetrySnapshot>,

    /// Callers waiting for the next completed round.
    parked: Vec<RequestId>,

    /// The cluster is stopping; missing replies are expected.
    stopping: bool,

    /// Current time.
    now: Duration,

    stats: AggregationStats,
}

/// Statistics from the aggregation service for metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationStats {
    /// Rounds that completed with every member answering.
    pub rounds_completed: u64,
    /// Rounds closed by the reply window expiring.
    pub rounds_timed_out: u64,
    /// Rounds that closed with no replies at all.
    pub rounds_empty: u64,
    /// Replies discarded because their round was already closed.
    pub stale_replies: u64,
    /// Replies discarded because the sender is not a member.
    pub non_member_replies: u64,
}

impl AggregationState {
    pub fn new(unit_id: UnitId, policy: &Policy, is_coordinator: bool) -> Self {
        Self {
            unit_id,
            is_coordinator,
            members: policy.members.clone(),
            collection_interval: policy.collection_interval,
            collection_timeout: policy.collection_timeout,
            next_round: 0,
            open: None,
            cache: None,
            parked: Vec::new(),
            stopping: false,
            now: Duration::ZERO,
            stats: AggregationStats::default(),
        }
    }

    /// Startup actions: the coordinator arms the collection cadence.
    pub fn initialize(&mut self) -> Vec<Action> {
        if !self.is_coordinator {
            return vec![];
        }
        vec![Action::SetTimer {
            id: TimerId::Collection,
            duration: self.collection_interval,
        }]
    }

    /// Called when the collection timer fires.
    ///
    /// Opens a new round unless one is already collecting. The next
    /// collection timer is armed when the round closes, not here, so the
    /// cadence is measured between round starts.
    pub fn on_collection_timer(&mut self) -> Vec<Action> {
        if !self.is_coordinator {
            return vec![];
        }
        if let Some(open) = &self.open {
            debug!(round = open.round, "collection timer while round in flight, skipping");
            return vec![];
        }

        let round = self.next_round;
        self.next_round += 1;
        self.open = Some(OpenRound {
            round,
            started_at: self.now,
            replies: BTreeMap::new(),
        });

        debug!(round, "opening telemetry collection round");
        vec![
            Action::Broadcast {
                message: TelemetryRequestBroadcast::new(round, self.unit_id).into(),
            },
            Action::SetTimer {
                id: TimerId::RoundTimeout,
                duration: self.collection_timeout,
            },
        ]
    }

    /// Called when a telemetry reply arrives.
    pub fn on_reply(&mut self, round: u64, telemetry: UnitTelemetry) -> Vec<Action> {
        let Some(open) = &mut self.open else {
            self.stats.stale_replies += 1;
            debug!(round, unit = %telemetry.unit_id, "telemetry reply with no round open");
            return vec![];
        };
        if open.round != round {
            self.stats.stale_replies += 1;
            debug!(
                round,
                open_round = open.round,
                unit = %telemetry.unit_id,
                "telemetry reply for a closed round"
            );
            return vec![];
        }
        if !self.members.contains(&telemetry.unit_id) {
            self.stats.non_member_replies += 1;
            warn!(
                round,
                unit = %telemetry.unit_id,
                "discarding telemetry reply from non-member unit"
            );
            return vec![];
        }

        open.replies.insert(telemetry.unit_id, telemetry);

        if open.replies.len() == self.members.len() {
            // Every member answered; no need to wait out the window.
            self.stats.rounds_completed += 1;
            let mut actions = vec![Action::CancelTimer {
                id: TimerId::RoundTimeout,
            }];
            actions.extend(self.close_round());
            return actions;
        }
        vec![]
    }

    /// Called when the reply window for the open round expires.
    pub fn on_round_timeout(&mut self) -> Vec<Action> {
        let Some(open) = &self.open else {
            return vec![];
        };

        if open.replies.is_empty() {
            self.stats.rounds_empty += 1;
            let round = open.round;
            let elapsed = self.now.saturating_sub(open.started_at);
            self.open = None;

            let mut actions = Vec::new();
            if self.stopping {
                warn!(round, "telemetry round received no replies while stopping");
            } else {
                error!(round, "telemetry round received no replies");
                let fault = FaultRecord::new(
                    FaultCategory::Logic,
                    FaultScope::Global,
                    FaultSeverity::Error,
                    self.unit_id,
                    format!("telemetry round {round} received no replies"),
                    "coordinator.telemetry",
                    self.now.as_millis() as u64,
                );
                actions.push(Action::Broadcast {
                    message: FaultReportBroadcast::new(fault).into(),
                });
            }

            // Keep the previous cache; an empty round says nothing about
            // the units, only about the bus.
            actions.extend(self.answer_parked_from_cache());
            actions.push(self.arm_collection(self.collection_interval.saturating_sub(elapsed)));
            return actions;
        }

        self.stats.rounds_timed_out += 1;
        debug!(
            round = open.round,
            replies = open.replies.len(),
            members = self.members.len(),
            "closing telemetry round on timeout with partial replies"
        );
        self.close_round()
    }

    /// Called when a caller asks for the cached snapshot.
    ///
    /// `not_older_than` of `None` always waits for the next round.
    pub fn on_get_cached(
        &mut self,
        request_id: RequestId,
        not_older_than: Option<Duration>,
    ) -> Vec<Action> {
        if !self.is_coordinator {
            return vec![Action::Reply {
                request_id,
                outcome: Err(RequestError::rejected("not the coordinator")),
            }];
        }

        if let (Some(bound), Some(cache)) = (not_older_than, &self.cache) {
            if cache.taken_at >= bound {
                return vec![Action::Reply {
                    request_id,
                    outcome: Ok(ReplyPayload::Snapshot(cache.clone())),
                }];
            }
        }

        self.parked.push(request_id);
        vec![]
    }

    /// Missing replies are expected while the cluster is stopping.
    pub fn set_stopping(&mut self, stopping: bool) {
        self.stopping = stopping;
    }

    /// Give up the coordinator role: stop the cadence and close out the
    /// open round without publishing a snapshot.
    pub fn demote(&mut self) -> Vec<Action> {
        if !self.is_coordinator {
            return vec![];
        }
        info!(unit = %self.unit_id, "aggregation service stopping, unit demoted");
        self.is_coordinator = false;
        self.open = None;

        let mut actions = vec![
            Action::CancelTimer {
                id: TimerId::Collection,
            },
            Action::CancelTimer {
                id: TimerId::RoundTimeout,
            },
        ];
        actions.extend(self.answer_parked_from_cache());
        actions
    }

    /// Last completed snapshot, if any.
    pub fn cached(&self) -> Option<&TelemetrySnapshot> {
        self.cache.as_ref()
    }

    /// Whether a round is currently collecting replies.
    pub fn is_round_open(&self) -> bool {
        self.open.is_some()
    }

    /// Callers currently parked waiting for a round.
    pub fn parked_callers(&self) -> usize {
        self.parked.len()
    }

    /// Get statistics for metrics.
    pub fn stats(&self) -> AggregationStats {
        self.stats
    }

    /// Close the open round into a snapshot: cache it, publish it
    /// internally, answer parked callers, re-arm the cadence.
    fn close_round(&mut self) -> Vec<Action> {
        let open = match self.open.take() {
            Some(open) => open,
            None => return vec![],
        };

        let snapshot = TelemetrySnapshot {
            units: open.replies,
            taken_at: self.now,
        };
        self.cache = Some(snapshot.clone());

        let mut actions = vec![Action::EnqueueInternal {
            event: Event::SnapshotReady {
                snapshot: snapshot.clone(),
            },
        }];
        for request_id in self.parked.drain(..) {
            actions.push(Action::Reply {
                request_id,
                outcome: Ok(ReplyPayload::Snapshot(snapshot.clone())),
            });
        }

        let elapsed = self.now.saturating_sub(open.started_at);
        actions.push(self.arm_collection(self.collection_interval.saturating_sub(elapsed)));
        actions
    }

    /// Answer parked callers from the existing cache, or fail them if no
    /// round has ever completed.
    fn answer_parked_from_cache(&mut self) -> Vec<Action> {
        let cache = self.cache.clone();
        self.parked
            .drain(..)
            .map(|request_id| Action::Reply {
                request_id,
                outcome: match &cache {
                    Some(snapshot) => Ok(ReplyPayload::Snapshot(snapshot.clone())),
                    None => Err(RequestError::rejected("no snapshot available")),
                },
            })
            .collect()
    }

    fn arm_collection(&self, duration: Duration) -> Action {
        Action::SetTimer {
            id: TimerId::Collection,
            duration,
        }
    }
}

impl SubStateMachine for AggregationState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::CollectionTimer => Some(self.on_collection_timer()),
            Event::RoundTimeoutTimer => Some(self.on_round_timeout()),
            Event::TelemetryReplyReceived { round, telemetry } => {
                Some(self.on_reply(*round, telemetry.clone()))
            }
            Event::CachedTelemetryRequested {
                request_id,
                not_older_than,
            } => Some(self.on_get_cached(*request_id, *not_older_than)),
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}
