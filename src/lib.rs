// lib.rs
pub mod config;
pub mod control_system;
pub mod error;
pub mod models;
pub mod monitoring;
pub mod simulation_engine;

pub use config::SimulationConfig;
pub use control_system::arbiter::{CrossingMode, IntersectionArbiter, PurgeOutcome};
pub use error::{SimError, SimResult};
pub use models::lane::{LaneId, PhaseGroup};
pub use models::vehicle::{LifecycleState, Maneuver, SpawnRequest, VehicleClass, VehicleId};
pub use monitoring::stats::ArbiterStats;
pub use simulation_engine::host::SimulationHost;
