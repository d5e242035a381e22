use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::lane::{Heading, LaneId};

/// Monotonically assigned vehicle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VehicleId(pub u64);

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// Vehicle classes. Priority and speed are carried as data, not behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    Normal,
    Emergency,
    PublicTransport,
    Heavy,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Normal,
        VehicleClass::Emergency,
        VehicleClass::PublicTransport,
        VehicleClass::Heavy,
    ];

    /// Right-of-way rank, higher goes first.
    pub fn priority(self) -> u8 {
        match self {
            VehicleClass::Normal => 1,
            VehicleClass::Heavy => 2,
            VehicleClass::PublicTransport => 5,
            VehicleClass::Emergency => 10,
        }
    }

    /// Multiplier applied to the configured base speed.
    pub fn speed_multiplier(self) -> f64 {
        match self {
            VehicleClass::Normal => 1.0,
            VehicleClass::Heavy => 0.6,
            VehicleClass::PublicTransport => 0.8,
            VehicleClass::Emergency => 1.5,
        }
    }

    pub fn is_emergency(self) -> bool {
        self == VehicleClass::Emergency
    }
}

/// What a vehicle does once it holds the crossing permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Maneuver {
    Straight,
    Left,
    Right,
    UTurn,
}

impl Maneuver {
    pub const ALL: [Maneuver; 4] = [
        Maneuver::Straight,
        Maneuver::Left,
        Maneuver::Right,
        Maneuver::UTurn,
    ];

    /// Heading the vehicle leaves the intersection with.
    pub fn exit_heading(self, entry: Heading) -> Heading {
        match self {
            Maneuver::Straight => entry,
            Maneuver::Left => entry.turned_left(),
            Maneuver::Right => entry.turned_right(),
            Maneuver::UTurn => entry.reversed(),
        }
    }

    /// Crossing time relative to a straight crossing.
    pub fn duration_factor(self) -> f64 {
        match self {
            Maneuver::Straight => 1.0,
            Maneuver::Right => 0.8,
            Maneuver::Left => 1.2,
            Maneuver::UTurn => 1.5,
        }
    }
}

/// Lifecycle of a vehicle agent.
///
/// Street vehicles go `Spawning -> Approaching -> InQueue -> AtStop -> WaitingTurn
/// -> Crossing -> Completed`. Avenue vehicles cruise (`Cruising <-> ChangingLane`)
/// until the merge point, then join the same sequence at `Approaching`.
/// `Yielding` can interrupt any state before `Crossing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Spawning,
    Cruising,
    ChangingLane,
    Yielding,
    Approaching,
    InQueue,
    AtStop,
    WaitingTurn,
    Crossing,
    Completed,
}

impl LifecycleState {
    /// Whether the vehicle physically occupies road space.
    pub fn is_on_road(self) -> bool {
        !matches!(self, LifecycleState::Spawning | LifecycleState::Completed)
    }
}

/// A spawn request coming from the simulation host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub class: VehicleClass,
    pub lane: LaneId,
    pub maneuver: Maneuver,
}

/// Immutable identity of a vehicle, fixed at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub class: VehicleClass,
    pub lane: LaneId,
    pub maneuver: Maneuver,
}

impl Vehicle {
    pub fn new(id: VehicleId, request: SpawnRequest) -> Self {
        Self {
            id,
            class: request.class,
            lane: request.lane,
            maneuver: request.maneuver,
        }
    }
}

/// Mutable kinematic state of one vehicle as seen by everyone else.
///
/// Agents publish one of these per tick; the following model and the host
/// only ever read copies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VehicleSnapshot {
    pub id: VehicleId,
    pub class: VehicleClass,
    pub lane: LaneId,
    /// Sub-lane within a multi-lane approach, 0 is the lane leading to the stop line.
    pub lane_index: u8,
    /// Distance travelled along the approach path.
    pub position: f64,
    pub speed: f64,
    pub state: LifecycleState,
    pub on_shoulder: bool,
    pub exit_heading: Heading,
}

impl VehicleSnapshot {
    pub fn spawning(vehicle: &Vehicle, lane_index: u8) -> Self {
        Self {
            id: vehicle.id,
            class: vehicle.class,
            lane: vehicle.lane,
            lane_index,
            position: 0.0,
            speed: 0.0,
            state: LifecycleState::Spawning,
            on_shoulder: false,
            exit_heading: vehicle.maneuver.exit_heading(vehicle.lane.heading()),
        }
    }
}
