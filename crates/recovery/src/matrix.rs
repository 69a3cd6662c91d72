//! The escalation matrix: which recovery sequence a fault cell gets.

use gridmesh_types::{FaultCategory, FaultScope, FaultSeverity};

/// One recovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// Ask the deal service to stop every interchange this unit is in,
    /// polling until none remain or the deadline passes.
    AskWaitStopDeals,
    /// Stop the local converter.
    StopDevice,
    /// Put this unit into stopping mode ahead of a shutdown.
    EnterStopping,
    /// Ask the coordinator to give up its role.
    DemoteCoordinator,
    /// Restart this unit process with fresh state.
    ResetSelf,
    /// Shut this unit process down.
    ShutdownSelf,
    /// Two-stage emergency device stop, then dispose every interchange.
    Scram,
    /// Force the cluster-wide trading mode to stop.
    ForceGlobalStop,
    /// Restart every unit process.
    ResetAll,
    /// Shut every unit process down.
    ShutdownAll,
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::AskWaitStopDeals => "ask-wait-stop-deals",
            Primitive::StopDevice => "stop-device",
            Primitive::EnterStopping => "enter-stopping",
            Primitive::DemoteCoordinator => "demote-coordinator",
            Primitive::ResetSelf => "reset-self",
            Primitive::ShutdownSelf => "shutdown-self",
            Primitive::Scram => "scram",
            Primitive::ForceGlobalStop => "force-global-stop",
            Primitive::ResetAll => "reset-all",
            Primitive::ShutdownAll => "shutdown-all",
        }
    }
}

/// Select the recovery sequence for one drained cell.
///
/// ERROR picks a category-specific sequence. FATAL and UNKNOWN severities
/// take the unconditional shutdown path regardless of category, and so
/// does the UNKNOWN category: a fault that cannot be classified cannot be
/// recovered from selectively.
pub fn sequence_for(
    scope: FaultScope,
    category: FaultCategory,
    severity: FaultSeverity,
) -> Vec<Primitive> {
    use Primitive::*;

    let fatal = matches!(severity, FaultSeverity::Fatal | FaultSeverity::Unknown)
        || category == FaultCategory::Unknown;

    match scope {
        FaultScope::Local => {
            if fatal {
                return vec![
                    AskWaitStopDeals,
                    StopDevice,
                    EnterStopping,
                    DemoteCoordinator,
                    ShutdownSelf,
                ];
            }
            let mut steps = vec![AskWaitStopDeals, StopDevice];
            if matches!(category, FaultCategory::Framework | FaultCategory::Logic) {
                steps.push(DemoteCoordinator);
                steps.push(ResetSelf);
            }
            steps
        }
        FaultScope::Global => {
            if fatal {
                return vec![Scram, ShutdownAll];
            }
            let mut steps = vec![Scram];
            match category {
                FaultCategory::Hardware => steps.push(ForceGlobalStop),
                FaultCategory::Framework | FaultCategory::Logic => steps.push(ResetAll),
                _ => {}
            }
            steps
        }
    }
}
