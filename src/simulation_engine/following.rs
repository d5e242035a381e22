use crate::config::FollowingConfig;
use crate::models::vehicle::{VehicleClass, VehicleId, VehicleSnapshot};

/// Nearest vehicle found by a same-lane scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearbyVehicle {
    pub id: VehicleId,
    pub class: VehicleClass,
    pub distance: f64,
    pub speed: f64,
}

/// Collision and safe-speed rules.
///
/// Stateless: every query reads a snapshot of active vehicles and mutates
/// nothing, so slightly stale snapshots only cost one tick of precision.
#[derive(Debug, Clone)]
pub struct FollowingModel {
    config: FollowingConfig,
    stop_line: f64,
}

impl FollowingModel {
    pub fn new(config: FollowingConfig, stop_line: f64) -> Self {
        Self { config, stop_line }
    }

    pub fn config(&self) -> &FollowingConfig {
        &self.config
    }

    /// Projects a vehicle onto the plane, intersection centre at the origin.
    ///
    /// Every approach is a straight line through the box; crossing vehicles
    /// keep following it, the turn shape is the renderer's business.
    pub fn world_position(&self, vehicle: &VehicleSnapshot, position: f64) -> (f64, f64) {
        let heading = vehicle.lane.heading();
        let (dx, dy) = heading.unit();
        let (rx, ry) = heading.right_normal();
        let along = position - self.stop_line - self.config.box_half_width;
        let slot = f64::from(vehicle.lane.base_slot() + vehicle.lane_index);
        let lateral = (slot + 0.5) * self.config.lane_width;
        (dx * along + rx * lateral, dy * along + ry * lateral)
    }

    /// Whether `vehicle` may advance to `candidate` without overlapping anyone.
    ///
    /// Same approach and sub-lane: reject when the vehicle ahead would be closer
    /// than the queueing-safety distance. Other approaches: bounding-box test
    /// with per-class radii. Emergency vehicles ignore vehicles pulled onto the
    /// shoulder of their own lane.
    pub fn can_move(
        &self,
        vehicle: &VehicleSnapshot,
        candidate: f64,
        active: &[VehicleSnapshot],
    ) -> bool {
        let safety = self.config.queueing_safety_distance;
        let here = self.world_position(vehicle, candidate);
        let my_radius = self.config.radius(vehicle.class);

        for other in active {
            if other.id == vehicle.id || !other.state.is_on_road() {
                continue;
            }

            if other.lane == vehicle.lane {
                if other.lane_index != vehicle.lane_index
                    || self.passes_on_shoulder(vehicle, other)
                    || other.position < vehicle.position
                {
                    continue;
                }
                if other.position - candidate < safety {
                    return false;
                }
            } else {
                let there = self.world_position(other, other.position);
                let reach = my_radius + self.config.radius(other.class);
                if (here.0 - there.0).abs() < reach && (here.1 - there.1).abs() < reach {
                    return false;
                }
            }
        }
        true
    }

    /// Gap check for moving into sub-lane `lane_index` (lane change or
    /// leaving the shoulder): nobody in that lane within the safety distance,
    /// ahead or behind.
    pub fn can_enter_lane(
        &self,
        vehicle: &VehicleSnapshot,
        lane_index: u8,
        active: &[VehicleSnapshot],
    ) -> bool {
        if lane_index >= vehicle.lane.lane_count() {
            return false;
        }
        let safety = self.config.queueing_safety_distance;
        !active.iter().any(|other| {
            other.id != vehicle.id
                && other.state.is_on_road()
                && other.lane == vehicle.lane
                && other.lane_index == lane_index
                && !other.on_shoulder
                && (other.position - vehicle.position).abs() < safety
        })
    }

    /// Nearest vehicle at or ahead of `vehicle` in its own sub-lane.
    pub fn detect_vehicle_ahead(
        &self,
        vehicle: &VehicleSnapshot,
        active: &[VehicleSnapshot],
    ) -> Option<NearbyVehicle> {
        active
            .iter()
            .filter(|other| {
                other.id != vehicle.id
                    && other.state.is_on_road()
                    && other.lane == vehicle.lane
                    && other.lane_index == vehicle.lane_index
                    && other.position >= vehicle.position
                    && !self.passes_on_shoulder(vehicle, other)
            })
            .map(|other| NearbyVehicle {
                id: other.id,
                class: other.class,
                distance: other.position - vehicle.position,
                speed: other.speed,
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    /// Nearest emergency vehicle closing from behind in the same sub-lane,
    /// within the yield distance. Emergency vehicles never yield.
    pub fn detect_emergency_behind(
        &self,
        vehicle: &VehicleSnapshot,
        active: &[VehicleSnapshot],
    ) -> Option<NearbyVehicle> {
        if vehicle.class.is_emergency() {
            return None;
        }
        active
            .iter()
            .filter(|other| {
                other.id != vehicle.id
                    && other.class.is_emergency()
                    && other.state.is_on_road()
                    && !other.on_shoulder
                    && other.lane == vehicle.lane
                    && other.lane_index == vehicle.lane_index
                    && other.position < vehicle.position
                    && vehicle.position - other.position <= self.config.yield_distance
            })
            .map(|other| NearbyVehicle {
                id: other.id,
                class: other.class,
                distance: vehicle.position - other.position,
                speed: other.speed,
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    /// Zero below the queueing-safety distance, linear ramp up to the
    /// braking distance, unchanged beyond it.
    pub fn safe_speed(&self, current_speed: f64, distance_ahead: f64) -> f64 {
        let stop = self.config.queueing_safety_distance;
        let brake = self.config.braking_distance;
        if distance_ahead < stop {
            0.0
        } else if distance_ahead < brake {
            current_speed * (distance_ahead - stop) / (brake - stop)
        } else {
            current_speed
        }
    }

    fn passes_on_shoulder(&self, mover: &VehicleSnapshot, other: &VehicleSnapshot) -> bool {
        mover.class.is_emergency() && !mover.on_shoulder && other.on_shoulder
    }
}
