//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one autonomous power-conversion unit in the cluster.
///
/// Unit ids are assigned by cluster configuration and stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Identifies one interchange (deal) between two units.
///
/// Assigned by the external deal service; opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DealId(pub u64);

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deal-{}", self.0)
    }
}
