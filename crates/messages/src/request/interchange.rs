//! Interchange deal stop and disposal requests.

use gridmesh_types::{DealId, NetworkMessage, Request};
use serde::{Deserialize, Serialize};

/// Asks the coordinator's trading layer to deactivate a deal.
///
/// Repeated sends for the same deal are expected: recovery polls this
/// address until the deal is actually deactivated or it gives up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDealRequest {
    pub deal_id: DealId,
    /// Fault messages explaining why the deal must stop.
    pub reasons: Vec<String>,
}

impl StopDealRequest {
    pub fn new(deal_id: DealId, reasons: Vec<String>) -> Self {
        Self { deal_id, reasons }
    }
}

impl NetworkMessage for StopDealRequest {
    fn message_type_id() -> &'static str {
        "interchange.stop.request"
    }
}

impl Request for StopDealRequest {
    type Response = ();
}

/// Asks the coordinator's trading layer to dispose of a deal entirely.
///
/// Sent for each ledger deal after a scram. A deal that is already gone
/// answers not-found, which callers treat as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisposeDealRequest {
    pub deal_id: DealId,
}

impl DisposeDealRequest {
    pub fn new(deal_id: DealId) -> Self {
        Self { deal_id }
    }
}

impl NetworkMessage for DisposeDealRequest {
    fn message_type_id() -> &'static str {
        "interchange.dispose"
    }
}

impl Request for DisposeDealRequest {
    type Response = ();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_ids() {
        assert_eq!(
            StopDealRequest::message_type_id(),
            "interchange.stop.request"
        );
        assert_eq!(DisposeDealRequest::message_type_id(), "interchange.dispose");
    }

    #[test]
    fn test_stop_carries_reasons() {
        let req = StopDealRequest::new(DealId(4), vec!["unit fault".into()]);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["dealId"], 4);
        assert_eq!(json["reasons"][0], "unit fault");
    }
}
