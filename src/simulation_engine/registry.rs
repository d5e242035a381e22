use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::models::vehicle::{VehicleId, VehicleSnapshot};

/// Latest published state of every live vehicle.
///
/// Agents write their own entry once per tick; the following model and the
/// host read copies. Nothing here is authoritative for arbitration.
#[derive(Debug, Default)]
pub struct VehicleRegistry {
    vehicles: RwLock<HashMap<VehicleId, VehicleSnapshot>>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: VehicleSnapshot) {
        self.vehicles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.id, snapshot);
    }

    pub fn remove(&self, id: VehicleId) -> Option<VehicleSnapshot> {
        self.vehicles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn get(&self, id: VehicleId) -> Option<VehicleSnapshot> {
        self.vehicles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    /// Copy of every entry, ordered by id.
    pub fn snapshot(&self) -> Vec<VehicleSnapshot> {
        let mut all: Vec<VehicleSnapshot> = self
            .vehicles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect();
        all.sort_by_key(|v| v.id);
        all
    }

    pub fn len(&self) -> usize {
        self.vehicles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
