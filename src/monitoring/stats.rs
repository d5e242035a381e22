use serde::Serialize;
use std::collections::BTreeMap;

use crate::control_system::arbiter::{CrossingMode, GlobalOrderEntry};
use crate::models::lane::LaneId;
use crate::models::vehicle::VehicleId;

/// Point-in-time view of the arbiter, taken under its lock.
#[derive(Debug, Clone, Serialize)]
pub struct ArbiterStats {
    pub mode: CrossingMode,
    pub total_waiting: usize,
    pub waiting_by_lane: BTreeMap<LaneId, usize>,
    /// Head of each lane if it is standing at the stop line.
    pub vehicle_at_stop: BTreeMap<LaneId, Option<VehicleId>>,
    pub congested_lanes: usize,
    pub rotation_lane: Option<LaneId>,
    pub emergency_active: bool,
    pub emergency_lane: Option<LaneId>,
    pub emergency_vehicle_id: Option<VehicleId>,
    pub emergency_episodes: u64,
    pub current_holder: Option<VehicleId>,
    pub permit_available: bool,
    pub grants_total: u64,
    pub orphans_recovered: u64,
    pub global_order: Vec<GlobalOrderEntry>,
}

impl ArbiterStats {
    /// One-line status used by the periodic monitor log.
    pub fn summary(&self) -> String {
        let holder = self
            .current_holder
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut line = format!(
            "mode={} waiting={} congested={} holder={} grants={} orphans={}",
            self.mode,
            self.total_waiting,
            self.congested_lanes,
            holder,
            self.grants_total,
            self.orphans_recovered
        );
        if let Some(lane) = self.rotation_lane {
            line.push_str(&format!(" rotation={:?}", lane));
        }
        if let (Some(lane), Some(id)) = (self.emergency_lane, self.emergency_vehicle_id) {
            line.push_str(&format!(" emergency={}@{:?}", id, lane));
        }
        line
    }
}
