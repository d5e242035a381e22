use serde::{Deserialize, Serialize};

use crate::models::vehicle::Maneuver;

/// Direction of travel on an approach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Heading {
    Northbound,
    Southbound,
    Eastbound,
    Westbound,
}

impl Heading {
    /// Unit vector of travel, +y pointing north.
    pub fn unit(self) -> (f64, f64) {
        match self {
            Heading::Northbound => (0.0, 1.0),
            Heading::Southbound => (0.0, -1.0),
            Heading::Eastbound => (1.0, 0.0),
            Heading::Westbound => (-1.0, 0.0),
        }
    }

    /// Unit vector pointing to the driver's right.
    pub fn right_normal(self) -> (f64, f64) {
        let (dx, dy) = self.unit();
        (dy, -dx)
    }

    pub fn turned_left(self) -> Heading {
        match self {
            Heading::Northbound => Heading::Westbound,
            Heading::Westbound => Heading::Southbound,
            Heading::Southbound => Heading::Eastbound,
            Heading::Eastbound => Heading::Northbound,
        }
    }

    pub fn turned_right(self) -> Heading {
        self.turned_left().reversed()
    }

    pub fn reversed(self) -> Heading {
        match self {
            Heading::Northbound => Heading::Southbound,
            Heading::Southbound => Heading::Northbound,
            Heading::Eastbound => Heading::Westbound,
            Heading::Westbound => Heading::Eastbound,
        }
    }
}

/// Traffic-light groups; exactly one is green at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PhaseGroup {
    NorthStreet,
    SouthStreet,
    UpperAvenue,
    LowerAvenue,
}

impl PhaseGroup {
    /// Round-robin order of the phase controller.
    pub const CYCLE: [PhaseGroup; 4] = [
        PhaseGroup::NorthStreet,
        PhaseGroup::UpperAvenue,
        PhaseGroup::SouthStreet,
        PhaseGroup::LowerAvenue,
    ];
}

/// Entry lanes into the intersection. Each one owns an approach queue.
///
/// The north and south streets are split into a left lane (left turns and
/// U-turns only) and a right lane (straight and right only). East and West are
/// two-lane avenues whose vehicles cruise before merging into the queue lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LaneId {
    NorthLeft,
    NorthRight,
    SouthLeft,
    SouthRight,
    East,
    West,
}

impl LaneId {
    pub const ALL: [LaneId; 6] = [
        LaneId::NorthLeft,
        LaneId::NorthRight,
        LaneId::SouthLeft,
        LaneId::SouthRight,
        LaneId::East,
        LaneId::West,
    ];

    /// Order in which ROTATE mode hands out turns.
    pub const ROTATION_ORDER: [LaneId; 6] = [
        LaneId::NorthLeft,
        LaneId::West,
        LaneId::SouthLeft,
        LaneId::SouthRight,
        LaneId::East,
        LaneId::NorthRight,
    ];

    /// Dense index, stable for the lifetime of the process.
    pub fn index(self) -> usize {
        match self {
            LaneId::NorthLeft => 0,
            LaneId::NorthRight => 1,
            LaneId::SouthLeft => 2,
            LaneId::SouthRight => 3,
            LaneId::East => 4,
            LaneId::West => 5,
        }
    }

    /// A "north" lane carries traffic entering from the north, i.e. southbound.
    pub fn heading(self) -> Heading {
        match self {
            LaneId::NorthLeft | LaneId::NorthRight => Heading::Southbound,
            LaneId::SouthLeft | LaneId::SouthRight => Heading::Northbound,
            LaneId::East => Heading::Westbound,
            LaneId::West => Heading::Eastbound,
        }
    }

    /// Number of sub-lanes vehicles can cruise in.
    pub fn lane_count(self) -> u8 {
        match self {
            LaneId::East | LaneId::West => 2,
            _ => 1,
        }
    }

    pub fn is_highway(self) -> bool {
        self.lane_count() > 1
    }

    /// Lateral slot of sub-lane 0, counted from the centre line.
    pub fn base_slot(self) -> u8 {
        match self {
            LaneId::NorthRight | LaneId::SouthRight => 1,
            _ => 0,
        }
    }

    pub fn phase_group(self) -> PhaseGroup {
        match self {
            LaneId::NorthLeft | LaneId::NorthRight => PhaseGroup::NorthStreet,
            LaneId::SouthLeft | LaneId::SouthRight => PhaseGroup::SouthStreet,
            LaneId::East => PhaseGroup::UpperAvenue,
            LaneId::West => PhaseGroup::LowerAvenue,
        }
    }

    pub fn allows(self, maneuver: Maneuver) -> bool {
        match self {
            LaneId::NorthLeft | LaneId::SouthLeft => {
                matches!(maneuver, Maneuver::Left | Maneuver::UTurn)
            }
            LaneId::NorthRight | LaneId::SouthRight => {
                matches!(maneuver, Maneuver::Straight | Maneuver::Right)
            }
            LaneId::East | LaneId::West => true,
        }
    }

    /// Maneuvers this lane accepts, in a fixed order.
    pub fn allowed_maneuvers(self) -> Vec<Maneuver> {
        Maneuver::ALL
            .into_iter()
            .filter(|m| self.allows(*m))
            .collect()
    }
}
