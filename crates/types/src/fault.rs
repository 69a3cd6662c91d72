//! Fault taxonomy and the immutable fault record.
//!
//! Every precondition violation anywhere in the cluster is reported as a
//! [`FaultRecord`] classified along three axes: what kind of failure
//! ([`FaultCategory`]), how far it reaches ([`FaultScope`]), and how bad it is
//! ([`FaultSeverity`]). The escalation dispatcher selects a recovery sequence
//! from the (scope, category, severity) combination.

use crate::UnitId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FaultCategory {
    /// Power-conversion hardware or its adapter misbehaved.
    Hardware,
    /// The messaging/runtime infrastructure failed.
    Framework,
    /// An internal invariant of the control plane was violated.
    Logic,
    /// An operator- or configuration-induced condition.
    User,
    /// Could not be classified.
    Unknown,
}

impl FaultCategory {
    /// All categories in sweep order.
    pub const ALL: [FaultCategory; 5] = [
        FaultCategory::Hardware,
        FaultCategory::Framework,
        FaultCategory::Logic,
        FaultCategory::User,
        FaultCategory::Unknown,
    ];
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultCategory::Hardware => "HARDWARE",
            FaultCategory::Framework => "FRAMEWORK",
            FaultCategory::Logic => "LOGIC",
            FaultCategory::User => "USER",
            FaultCategory::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// How far the failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FaultScope {
    /// Affects only the origin unit; retained only there.
    Local,
    /// Affects the whole cluster; handled by the coordinator.
    Global,
}

impl fmt::Display for FaultScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultScope::Local => "LOCAL",
            FaultScope::Global => "GLOBAL",
        };
        f.write_str(s)
    }
}

/// How bad the failure is.
///
/// WARN is advisory-only: it is logged but never stored and never escalates.
/// FATAL and UNKNOWN both trigger the unconditional shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FaultSeverity {
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl FaultSeverity {
    /// All severities in sweep order.
    pub const ALL: [FaultSeverity; 4] = [
        FaultSeverity::Warn,
        FaultSeverity::Error,
        FaultSeverity::Fatal,
        FaultSeverity::Unknown,
    ];
}

impl fmt::Display for FaultSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultSeverity::Warn => "WARN",
            FaultSeverity::Error => "ERROR",
            FaultSeverity::Fatal => "FATAL",
            FaultSeverity::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One reported fault. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    pub category: FaultCategory,
    pub scope: FaultScope,
    pub severity: FaultSeverity,
    /// The unit that observed and reported the condition.
    pub origin_unit_id: UnitId,
    /// Human-readable description, used for audit logging and de-duplicated
    /// reason lists.
    pub message: String,
    /// Where in the code the condition was observed (component.site).
    pub origin_location: String,
    /// Milliseconds of process uptime at the origin when reported.
    pub timestamp_ms: u64,
}

impl FaultRecord {
    pub fn new(
        category: FaultCategory,
        scope: FaultScope,
        severity: FaultSeverity,
        origin_unit_id: UnitId,
        message: impl Into<String>,
        origin_location: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            category,
            scope,
            severity,
            origin_unit_id,
            message: message.into(),
            origin_location: origin_location.into(),
            timestamp_ms,
        }
    }

    /// True for advisory-only faults that must never be stored.
    pub fn is_warn(&self) -> bool {
        self.severity == FaultSeverity::Warn
    }

    /// True when this fault triggers the unconditional shutdown sequence.
    pub fn is_fatal_class(&self) -> bool {
        matches!(
            self.severity,
            FaultSeverity::Fatal | FaultSeverity::Unknown
        ) || self.category == FaultCategory::Unknown
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} from {} at {}: {}",
            self.category, self.scope, self.severity, self.origin_unit_id, self.origin_location, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_order_covers_grid() {
        assert_eq!(FaultCategory::ALL.len(), 5);
        assert_eq!(FaultSeverity::ALL.len(), 4);
        // 5 x 4 cells, Warn first so invariant violations surface early.
        assert_eq!(FaultSeverity::ALL[0], FaultSeverity::Warn);
    }

    #[test]
    fn test_fatal_class() {
        let fatal = FaultRecord::new(
            FaultCategory::Hardware,
            FaultScope::Local,
            FaultSeverity::Fatal,
            UnitId(0),
            "m",
            "l",
            0,
        );
        assert!(fatal.is_fatal_class());

        let unknown_severity = FaultRecord {
            severity: FaultSeverity::Unknown,
            ..fatal.clone()
        };
        assert!(unknown_severity.is_fatal_class());

        let unknown_category = FaultRecord {
            category: FaultCategory::Unknown,
            severity: FaultSeverity::Error,
            ..fatal.clone()
        };
        assert!(unknown_category.is_fatal_class());

        let plain_error = FaultRecord {
            severity: FaultSeverity::Error,
            ..fatal
        };
        assert!(!plain_error.is_fatal_class());
    }

    #[test]
    fn test_display() {
        let fault = FaultRecord::new(
            FaultCategory::Logic,
            FaultScope::Global,
            FaultSeverity::Error,
            UnitId(2),
            "another coordinator exists",
            "helo.heartbeat",
            1234,
        );
        let rendered = fault.to_string();
        assert!(rendered.contains("LOGIC/GLOBAL/ERROR"));
        assert!(rendered.contains("unit-2"));
        assert!(rendered.contains("helo.heartbeat"));
    }
}
