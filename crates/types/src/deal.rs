//! Interchange ("deal") records and the local read-model ledger.
//!
//! Deal storage and lifecycle belong to the external deal service; the core
//! only mirrors the records it has been told about and reads their fields.
//! Every unit maintains its own [`DealLedger`] from the register / update /
//! remove notifications on the bus.

use crate::{DealId, DeviceMode, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which side of an interchange a unit is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DealSide {
    Discharge,
    Charge,
}

impl DealSide {
    /// The passive device mode a unit on this side runs in.
    pub fn passive_mode(&self) -> DeviceMode {
        match self {
            DealSide::Discharge => DeviceMode::Discharge,
            DealSide::Charge => DeviceMode::Charge,
        }
    }
}

/// Activity of one side of an interchange. Each side moves independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SideActivity {
    /// Agreed but not yet moving power.
    Inactive,
    /// Currently moving power.
    Active,
    /// Ramped down; will not reactivate.
    Deactivated,
}

/// One interchange as mirrored from the external deal service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealRecord {
    pub deal_id: DealId,
    pub discharge_unit: UnitId,
    pub charge_unit: UnitId,
    pub discharge_activity: SideActivity,
    pub charge_activity: SideActivity,
    /// Efficient grid voltage hint for the discharge side, if negotiated.
    pub discharge_grid_voltage: Option<f64>,
    /// Efficient grid voltage hint for the charge side, if negotiated.
    pub charge_grid_voltage: Option<f64>,
    /// Set locally when an emergency stop has claimed this deal.
    #[serde(default)]
    pub scrammed: bool,
}

impl DealRecord {
    pub fn involves(&self, unit: UnitId) -> bool {
        self.discharge_unit == unit || self.charge_unit == unit
    }

    pub fn side_of(&self, unit: UnitId) -> Option<DealSide> {
        if self.discharge_unit == unit {
            Some(DealSide::Discharge)
        } else if self.charge_unit == unit {
            Some(DealSide::Charge)
        } else {
            None
        }
    }

    /// The unit on the opposite side from `unit`, if `unit` participates.
    pub fn counterparty(&self, unit: UnitId) -> Option<UnitId> {
        match self.side_of(unit)? {
            DealSide::Discharge => Some(self.charge_unit),
            DealSide::Charge => Some(self.discharge_unit),
        }
    }

    pub fn activity(&self, side: DealSide) -> SideActivity {
        match side {
            DealSide::Discharge => self.discharge_activity,
            DealSide::Charge => self.charge_activity,
        }
    }

    pub fn both_sides_active(&self) -> bool {
        self.discharge_activity == SideActivity::Active
            && self.charge_activity == SideActivity::Active
    }

    /// Grid voltage hint for the given side.
    pub fn grid_voltage_hint(&self, side: DealSide) -> Option<f64> {
        match side {
            DealSide::Discharge => self.discharge_grid_voltage,
            DealSide::Charge => self.charge_grid_voltage,
        }
    }
}

/// Read-model of all currently-known interchanges, keyed by deal id.
#[derive(Debug, Clone, Default)]
pub struct DealLedger {
    deals: BTreeMap<DealId, DealRecord>,
}

impl DealLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record. A locally-set scram mark survives updates
    /// from the deal service, which does not know about it.
    pub fn upsert(&mut self, mut deal: DealRecord) {
        if let Some(existing) = self.deals.get(&deal.deal_id) {
            deal.scrammed = deal.scrammed || existing.scrammed;
        }
        self.deals.insert(deal.deal_id, deal);
    }

    pub fn remove(&mut self, deal_id: DealId) -> Option<DealRecord> {
        self.deals.remove(&deal_id)
    }

    pub fn get(&self, deal_id: DealId) -> Option<&DealRecord> {
        self.deals.get(&deal_id)
    }

    pub fn mark_scrammed(&mut self, deal_id: DealId) {
        if let Some(deal) = self.deals.get_mut(&deal_id) {
            deal.scrammed = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DealRecord> {
        self.deals.values()
    }

    /// All deal ids in stable order.
    pub fn deal_ids(&self) -> Vec<DealId> {
        self.deals.keys().copied().collect()
    }

    /// Deals in which `unit` participates on a side that is not yet
    /// deactivated. These are the deals the ask-and-wait primitive must get
    /// stopped before hardware recovery can proceed.
    pub fn undeactivated_for(&self, unit: UnitId) -> Vec<DealId> {
        self.deals
            .values()
            .filter(|d| {
                d.side_of(unit)
                    .is_some_and(|side| d.activity(side) != SideActivity::Deactivated)
            })
            .map(|d| d.deal_id)
            .collect()
    }

    /// Number of deals currently gripping `unit` (side active).
    pub fn interlock_count(&self, unit: UnitId) -> u32 {
        self.deals
            .values()
            .filter(|d| {
                d.side_of(unit)
                    .is_some_and(|side| d.activity(side) == SideActivity::Active)
            })
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.deals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deals.is_empty()
    }
}
