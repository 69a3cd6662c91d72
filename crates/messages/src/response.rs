//! Reply payloads and request failure taxonomy.

use gridmesh_types::{DeviceStatus, TelemetrySnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Successful reply to any request, tagged with its payload kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum ReplyPayload {
    /// Plain acknowledgement with no data.
    Ack,
    /// Answer to a local fault query.
    HasActiveFault(bool),
    /// Answer to a cached-telemetry request.
    Snapshot(TelemetrySnapshot),
    /// Device status after executing a command.
    DeviceStatus(DeviceStatus),
}

impl ReplyPayload {
    pub fn as_snapshot(&self) -> Option<&TelemetrySnapshot> {
        match self {
            Self::Snapshot(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    pub fn as_device_status(&self) -> Option<&DeviceStatus> {
        match self {
            Self::DeviceStatus(status) => Some(status),
            _ => None,
        }
    }

    pub fn as_has_active_fault(&self) -> Option<bool> {
        match self {
            Self::HasActiveFault(value) => Some(*value),
            _ => None,
        }
    }
}

/// Why a request did not produce a successful reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestErrorKind {
    /// The remote side answered and declined.
    Rejected,
    /// The remote side does not know the addressed entity.
    NotFound,
    /// No reply arrived within the request timeout.
    Timeout,
    /// No route to the destination exists right now.
    Unreachable,
}

impl fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rejected => "rejected",
            Self::NotFound => "not found",
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

/// Failed outcome of a request.
///
/// `Rejected` and `NotFound` come back from the remote side and are
/// ordinary answers. `Timeout` and `Unreachable` are produced by the
/// messaging layer and indicate an infrastructure problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("request {kind}: {detail}")]
pub struct RequestError {
    pub kind: RequestErrorKind,
    pub detail: String,
}

impl RequestError {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            kind: RequestErrorKind::Rejected,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            kind: RequestErrorKind::NotFound,
            detail: detail.into(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            kind: RequestErrorKind::Timeout,
            detail: "no reply before deadline".to_string(),
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            kind: RequestErrorKind::Unreachable,
            detail: detail.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RequestErrorKind::NotFound
    }

    pub fn is_rejected(&self) -> bool {
        self.kind == RequestErrorKind::Rejected
    }

    /// Whether the failure came from the messaging layer rather than from
    /// the remote side answering.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self.kind,
            RequestErrorKind::Timeout | RequestErrorKind::Unreachable
        )
    }
}

/// Every request resolves to exactly one outcome.
pub type RequestOutcome = Result<ReplyPayload, RequestError>;
