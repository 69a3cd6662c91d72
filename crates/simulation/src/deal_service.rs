//! Simulated trading-layer deal service.

use gridmesh_messages::{
    DealRegisteredBroadcast, DealRemovedBroadcast, DealUpdatedBroadcast, ReplyPayload,
    RequestError, RequestOutcome,
};
use gridmesh_types::{DealId, DealRecord, SideActivity};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Behavior knobs for the simulated deal service.
#[derive(Debug, Clone)]
pub struct DealServiceConfig {
    /// Stop requests a deal must receive before its sides deactivate.
    /// Recovery polls once per `stop_poll_interval`, so a value of 3 makes
    /// the ask-and-wait primitive take roughly two poll periods.
    pub stop_requests_to_deactivate: u32,
    /// Acknowledge stop requests but never actually deactivate, forcing
    /// callers onto their stop deadline.
    pub never_deactivate: bool,
    /// Refuse disposal requests.
    pub refuse_dispose: bool,
}

impl Default for DealServiceConfig {
    fn default() -> Self {
        Self {
            stop_requests_to_deactivate: 1,
            never_deactivate: false,
            refuse_dispose: false,
        }
    }
}

/// The authoritative deal store of the simulation.
///
/// Units only mirror deal records from notifications; this service owns
/// them. It serves the stop and dispose addresses and hands the runner a
/// notification to broadcast whenever a record changes.
///
/// A stop request is acknowledged immediately; deactivation happens
/// asynchronously once enough requests have arrived, mirroring a trading
/// layer that winds an interchange down on its own schedule.
#[derive(Debug, Default)]
pub struct SimulatedDealService {
    config: DealServiceConfig,
    deals: BTreeMap<DealId, DealRecord>,
    stop_asks: BTreeMap<DealId, u32>,
    stops_received: u64,
    disposals_received: u64,
}

impl SimulatedDealService {
    pub fn new(config: DealServiceConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config_mut(&mut self) -> &mut DealServiceConfig {
        &mut self.config
    }

    /// Register a new deal. The returned notification must be broadcast.
    pub fn register(&mut self, deal: DealRecord) -> DealRegisteredBroadcast {
        info!(deal = %deal.deal_id, "deal registered");
        self.deals.insert(deal.deal_id, deal.clone());
        DealRegisteredBroadcast::new(deal)
    }

    /// Replace a deal record. The returned notification must be broadcast.
    pub fn update(&mut self, deal: DealRecord) -> DealUpdatedBroadcast {
        self.deals.insert(deal.deal_id, deal.clone());
        DealUpdatedBroadcast::new(deal)
    }

    /// Serve one stop request.
    ///
    /// Returns the reply outcome and, when the request tipped the deal
    /// into deactivation, the update notification to broadcast.
    pub fn on_stop(
        &mut self,
        deal_id: DealId,
        reasons: &[String],
    ) -> (RequestOutcome, Option<DealUpdatedBroadcast>) {
        self.stops_received += 1;
        let Some(deal) = self.deals.get_mut(&deal_id) else {
            return (
                Err(RequestError::not_found(format!("{deal_id} is not registered"))),
                None,
            );
        };

        let asks = self.stop_asks.entry(deal_id).or_insert(0);
        *asks += 1;
        debug!(deal = %deal_id, asks = *asks, ?reasons, "stop requested");

        let already_done = deal.discharge_activity == SideActivity::Deactivated
            && deal.charge_activity == SideActivity::Deactivated;
        let notification = if !self.config.never_deactivate
            && !already_done
            && *asks >= self.config.stop_requests_to_deactivate
        {
            deal.discharge_activity = SideActivity::Deactivated;
            deal.charge_activity = SideActivity::Deactivated;
            info!(deal = %deal_id, "deal deactivated");
            Some(DealUpdatedBroadcast::new(deal.clone()))
        } else {
            None
        };

        (Ok(ReplyPayload::Ack), notification)
    }

    /// Serve one disposal request.
    ///
    /// Returns the reply outcome and, on success, the removal
    /// notification to broadcast.
    pub fn on_dispose(
        &mut self,
        deal_id: DealId,
    ) -> (RequestOutcome, Option<DealRemovedBroadcast>) {
        self.disposals_received += 1;
        if !self.deals.contains_key(&deal_id) {
            return (
                Err(RequestError::not_found(format!("{deal_id} is not registered"))),
                None,
            );
        }
        if self.config.refuse_dispose {
            return (
                Err(RequestError::rejected(format!("{deal_id} cannot be disposed"))),
                None,
            );
        }

        self.deals.remove(&deal_id);
        self.stop_asks.remove(&deal_id);
        info!(deal = %deal_id, "deal disposed");
        (Ok(ReplyPayload::Ack), Some(DealRemovedBroadcast::new(deal_id)))
    }

    /// Deals involving `unit`, for re-seeding a restarted unit's ledger.
    pub fn deals_involving(&self, unit: gridmesh_types::UnitId) -> Vec<DealRecord> {
        self.deals
            .values()
            .filter(|d| d.involves(unit))
            .cloned()
            .collect()
    }

    pub fn deal(&self, deal_id: DealId) -> Option<&DealRecord> {
        self.deals.get(&deal_id)
    }

    pub fn len(&self) -> usize {
        self.deals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deals.is_empty()
    }

    pub fn stops_received(&self) -> u64 {
        self.stops_received
    }

    pub fn disposals_received(&self) -> u64 {
        self.disposals_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmesh_types::test_utils::test_deal;
    use gridmesh_types::UnitId;

    #[test]
    fn test_stop_acks_then_deactivates_at_threshold() {
        let mut service = SimulatedDealService::new(DealServiceConfig {
            stop_requests_to_deactivate: 2,
            ..Default::default()
        });
        service.register(test_deal(1, 10, 20));

        let (outcome, notification) = service.on_stop(DealId(1), &[]);
        assert!(matches!(outcome, Ok(ReplyPayload::Ack)));
        assert!(notification.is_none(), "first ask only acknowledged");

        let (outcome, notification) = service.on_stop(DealId(1), &[]);
        assert!(matches!(outcome, Ok(ReplyPayload::Ack)));
        let update = notification.expect("second ask tips into deactivation");
        assert_eq!(update.deal.discharge_activity, SideActivity::Deactivated);
        assert_eq!(update.deal.charge_activity, SideActivity::Deactivated);
    }

    #[test]
    fn test_never_deactivate_acks_forever() {
        let mut service = SimulatedDealService::new(DealServiceConfig {
            never_deactivate: true,
            ..Default::default()
        });
        service.register(test_deal(1, 10, 20));

        for _ in 0..10 {
            let (outcome, notification) = service.on_stop(DealId(1), &[]);
            assert!(outcome.is_ok());
            assert!(notification.is_none());
        }
        assert_eq!(service.stops_received(), 10);
    }

    #[test]
    fn test_stop_unknown_deal_is_not_found() {
        let mut service = SimulatedDealService::default();
        let (outcome, _) = service.on_stop(DealId(9), &[]);
        assert!(outcome.is_err_and(|e| e.is_not_found()));
    }

    #[test]
    fn test_dispose_removes_and_notifies() {
        let mut service = SimulatedDealService::default();
        service.register(test_deal(1, 10, 20));

        let (outcome, notification) = service.on_dispose(DealId(1));
        assert!(outcome.is_ok());
        assert_eq!(notification.map(|n| n.deal_id), Some(DealId(1)));
        assert!(service.is_empty());

        // A second disposal finds nothing.
        let (outcome, _) = service.on_dispose(DealId(1));
        assert!(outcome.is_err_and(|e| e.is_not_found()));
    }

    #[test]
    fn test_refused_dispose_keeps_the_deal() {
        let mut service = SimulatedDealService::new(DealServiceConfig {
            refuse_dispose: true,
            ..Default::default()
        });
        service.register(test_deal(1, 10, 20));

        let (outcome, notification) = service.on_dispose(DealId(1));
        assert!(outcome.is_err_and(|e| e.is_rejected()));
        assert!(notification.is_none());
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn test_deals_involving_filters_by_participant() {
        let mut service = SimulatedDealService::default();
        service.register(test_deal(1, 10, 20));
        service.register(test_deal(2, 20, 30));

        assert_eq!(service.deals_involving(UnitId(10)).len(), 1);
        assert_eq!(service.deals_involving(UnitId(20)).len(), 2);
        assert_eq!(service.deals_involving(UnitId(40)).len(), 0);
    }
}
