use serde::Serialize;

use crate::models::lane::LaneId;
use crate::models::vehicle::VehicleId;

/// The vehicle and lane that currently hold absolute arbitration priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmergencyEpisode {
    pub lane: LaneId,
    pub vehicle_id: VehicleId,
}

/// INACTIVE -> ACTIVE -> INACTIVE, one cycle per episode.
///
/// Lives inside the arbiter state and is only touched under the arbiter lock.
#[derive(Debug, Clone, Default)]
pub struct EmergencyProtocol {
    episode: Option<EmergencyEpisode>,
    episodes_started: u64,
}

impl EmergencyProtocol {
    pub fn is_active(&self) -> bool {
        self.episode.is_some()
    }

    pub fn episode(&self) -> Option<EmergencyEpisode> {
        self.episode
    }

    pub fn lane(&self) -> Option<LaneId> {
        self.episode.map(|e| e.lane)
    }

    pub fn vehicle_id(&self) -> Option<VehicleId> {
        self.episode.map(|e| e.vehicle_id)
    }

    pub fn episodes_started(&self) -> u64 {
        self.episodes_started
    }

    pub fn is_episode_vehicle(&self, vehicle_id: VehicleId) -> bool {
        self.vehicle_id() == Some(vehicle_id)
    }

    /// Starts an episode. A second emergency while one is active is absorbed:
    /// returns `false` and leaves the running episode untouched.
    pub fn activate(&mut self, lane: LaneId, vehicle_id: VehicleId) -> bool {
        if self.episode.is_some() {
            return false;
        }
        self.episode = Some(EmergencyEpisode { lane, vehicle_id });
        self.episodes_started += 1;
        log::warn!(
            "Emergency protocol ACTIVATED: vehicle {} on {:?} has absolute priority",
            vehicle_id,
            lane
        );
        true
    }

    /// Ends the episode if `vehicle_id` owns it.
    pub fn deactivate(&mut self, vehicle_id: VehicleId) -> Option<EmergencyEpisode> {
        if !self.is_episode_vehicle(vehicle_id) {
            return None;
        }
        let ended = self.episode.take();
        log::warn!("Emergency protocol DEACTIVATED: vehicle {} cleared", vehicle_id);
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_emergency_is_absorbed() {
        let mut protocol = EmergencyProtocol::default();
        assert!(protocol.activate(LaneId::East, VehicleId(1)));
        assert!(!protocol.activate(LaneId::West, VehicleId(2)));
        assert_eq!(protocol.lane(), Some(LaneId::East));
        assert_eq!(protocol.episodes_started(), 1);
    }

    #[test]
    fn only_the_episode_vehicle_ends_it() {
        let mut protocol = EmergencyProtocol::default();
        protocol.activate(LaneId::SouthLeft, VehicleId(7));
        assert!(protocol.deactivate(VehicleId(8)).is_none());
        assert!(protocol.is_active());
        assert!(protocol.deactivate(VehicleId(7)).is_some());
        assert!(!protocol.is_active());
        assert!(protocol.deactivate(VehicleId(7)).is_none());
    }
}
