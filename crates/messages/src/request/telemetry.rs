//! Cached snapshot retrieval.

use std::time::Duration;

use gridmesh_types::{NetworkMessage, Request, TelemetrySnapshot};
use serde::{Deserialize, Serialize};

/// Asks the aggregation service for its telemetry snapshot.
///
/// With no freshness bound the caller is parked until the next round
/// completes. With a bound, a cached snapshot taken at or after the bound
/// is returned immediately; otherwise the caller waits for the next round.
///
/// The bound is measured on the responder's snapshot clock: callers pass
/// the `taken_at` of a snapshot they already hold to ask for anything
/// newer than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTelemetryRequest {
    /// Oldest acceptable `taken_at`, in milliseconds, or `None` to always
    /// wait for a fresh round.
    pub not_older_than_ms: Option<u64>,
}

impl CachedTelemetryRequest {
    /// Always wait for the next completed round.
    pub fn fresh() -> Self {
        Self {
            not_older_than_ms: None,
        }
    }

    /// Accept any snapshot taken at or after the given instant.
    pub fn newer_than(taken_at: Duration) -> Self {
        Self {
            not_older_than_ms: Some(taken_at.as_millis() as u64),
        }
    }

    /// The freshness bound as a [`Duration`], if one was given.
    pub fn bound(&self) -> Option<Duration> {
        self.not_older_than_ms.map(Duration::from_millis)
    }
}

impl NetworkMessage for CachedTelemetryRequest {
    fn message_type_id() -> &'static str {
        "coordinator.telemetry.getCached"
    }
}

impl Request for CachedTelemetryRequest {
    type Response = TelemetrySnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_id() {
        assert_eq!(
            CachedTelemetryRequest::message_type_id(),
            "coordinator.telemetry.getCached"
        );
    }

    #[test]
    fn test_fresh_has_no_bound() {
        let json = serde_json::to_value(CachedTelemetryRequest::fresh()).unwrap();
        assert_eq!(json["notOlderThanMs"], serde_json::Value::Null);
    }

    #[test]
    fn test_bound_round_trips_as_millis() {
        let req = CachedTelemetryRequest::newer_than(Duration::from_millis(12_500));
        assert_eq!(req.bound(), Some(Duration::from_millis(12_500)));
    }
}
