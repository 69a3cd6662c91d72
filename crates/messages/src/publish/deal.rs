//! Interchange deal lifecycle notifications.
//!
//! Published by whichever unit's trading layer registered or changed a
//! deal; every unit mirrors the stream into its own ledger so stop and
//! scram handling can enumerate deals without asking anyone.

use gridmesh_types::{DealId, DealRecord, NetworkMessage};
use serde::{Deserialize, Serialize};

/// A new deal was registered between two units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealRegisteredBroadcast {
    pub deal: DealRecord,
}

impl DealRegisteredBroadcast {
    pub fn new(deal: DealRecord) -> Self {
        Self { deal }
    }
}

impl NetworkMessage for DealRegisteredBroadcast {
    fn message_type_id() -> &'static str {
        "interchange.registered"
    }
}

/// An existing deal changed state (side activation, voltage hints).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealUpdatedBroadcast {
    pub deal: DealRecord,
}

impl DealUpdatedBroadcast {
    pub fn new(deal: DealRecord) -> Self {
        Self { deal }
    }
}

impl NetworkMessage for DealUpdatedBroadcast {
    fn message_type_id() -> &'static str {
        "interchange.updated"
    }
}

/// A deal was disposed and should leave every ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealRemovedBroadcast {
    pub deal_id: DealId,
}

impl DealRemovedBroadcast {
    pub fn new(deal_id: DealId) -> Self {
        Self { deal_id }
    }
}

impl NetworkMessage for DealRemovedBroadcast {
    fn message_type_id() -> &'static str {
        "interchange.removed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmesh_types::test_utils::test_deal;

    #[test]
    fn test_message_type_ids() {
        assert_eq!(
            DealRegisteredBroadcast::message_type_id(),
            "interchange.registered"
        );
        assert_eq!(
            DealUpdatedBroadcast::message_type_id(),
            "interchange.updated"
        );
        assert_eq!(
            DealRemovedBroadcast::message_type_id(),
            "interchange.removed"
        );
    }

    #[test]
    fn test_registered_wire_shape() {
        let msg = DealRegisteredBroadcast::new(test_deal(9, 1, 2));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["deal"]["dealId"], 9);
        assert_eq!(json["deal"]["dischargeUnit"], 1);
    }
}
