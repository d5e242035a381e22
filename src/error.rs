use thiserror::Error;

use crate::models::lane::LaneId;
use crate::models::vehicle::{Maneuver, VehicleId};

/// Errors surfaced by the crossing engine.
///
/// Arbitration races (a vehicle losing head-of-queue between a check and the
/// permit acquisition) are not errors: `request_crossing` simply answers `false`
/// and the agent polls again.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("lane {lane:?} does not accept {maneuver:?} maneuvers")]
    InvalidManeuver { lane: LaneId, maneuver: Maneuver },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vehicle {0} is not known to the simulation")]
    UnknownVehicle(VehicleId),

    #[error("simulation host has been shut down")]
    ShutDown,
}

pub type SimResult<T> = Result<T, SimError>;
