// simulation_engine/mod.rs
pub mod agent;
pub mod approach_queue;
pub mod following;
pub mod host;
pub mod registry;
