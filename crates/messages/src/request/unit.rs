//! Unit lifecycle requests: demote, shutdown, reset.

use gridmesh_types::{NetworkMessage, Request};
use serde::{Deserialize, Serialize};

/// Asks the current coordinator to give up the role.
///
/// Failure to deliver this request is itself cause for unconditional
/// shutdown of the requesting unit: a cluster that cannot demote a faulty
/// coordinator must not keep running under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoteRequest {
    pub reasons: Vec<String>,
}

impl DemoteRequest {
    pub fn new(reasons: Vec<String>) -> Self {
        Self { reasons }
    }
}

impl NetworkMessage for DemoteRequest {
    fn message_type_id() -> &'static str {
        "coordinator.demote"
    }
}

impl Request for DemoteRequest {
    type Response = ();
}

/// Orders one unit process to shut down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownRequest {
    pub reasons: Vec<String>,
}

impl ShutdownRequest {
    pub fn new(reasons: Vec<String>) -> Self {
        Self { reasons }
    }
}

impl NetworkMessage for ShutdownRequest {
    fn message_type_id() -> &'static str {
        "unit.shutdown.local"
    }
}

impl Request for ShutdownRequest {
    type Response = ();
}

/// Orders one unit process to restart with fresh state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub reasons: Vec<String>,
}

impl ResetRequest {
    pub fn new(reasons: Vec<String>) -> Self {
        Self { reasons }
    }
}

impl NetworkMessage for ResetRequest {
    fn message_type_id() -> &'static str {
        "unit.reset.local"
    }
}

impl Request for ResetRequest {
    type Response = ();
}
